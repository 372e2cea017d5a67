//! Format detection and the load pipeline.

use std::fmt::Write as _;

use um_ir::{ModError, Module, ModuleBuilder, ModuleFlags, PAN_HALFLEFT, PAN_HALFRIGHT};

use crate::loader::{LoadOptions, LoadedModule, Loader};
use crate::reader::{ByteReader, MemReader};
use crate::samples::SampleDecoder;
use crate::{
    AmfLoader, DsmLoader, FarLoader, GdmLoader, ImfLoader, ItLoader, M15Loader, MedLoader,
    ModLoader, MtmLoader, OktLoader, S3mLoader, S69Loader, StmLoader, StxLoader, UltLoader,
    UniLoader, XmLoader,
};

/// Ordered set of loaders. The first loader whose test accepts the stream
/// wins, so specific signatures are registered before generic ones.
pub struct Registry {
    loaders: Vec<Box<dyn Loader>>,
    last_error: Option<ModError>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_all()
    }
}

impl Registry {
    /// A registry with no loaders.
    pub fn new() -> Self {
        Self {
            loaders: Vec::new(),
            last_error: None,
        }
    }

    /// A registry with every built-in loader in probing order.
    pub fn with_all() -> Self {
        let mut reg = Self::new();
        reg.register(Box::<ItLoader>::default());
        reg.register(Box::<XmLoader>::default());
        reg.register(Box::<S3mLoader>::default());
        reg.register(Box::<StxLoader>::default());
        reg.register(Box::<StmLoader>::default());
        reg.register(Box::<MedLoader>::default());
        reg.register(Box::<OktLoader>::default());
        reg.register(Box::<FarLoader>::default());
        reg.register(Box::<S69Loader>::default());
        reg.register(Box::<AmfLoader>::default());
        reg.register(Box::<DsmLoader>::default());
        reg.register(Box::<GdmLoader>::default());
        reg.register(Box::<ImfLoader>::default());
        reg.register(Box::<MtmLoader>::default());
        reg.register(Box::<UltLoader>::default());
        reg.register(Box::<UniLoader>::default());
        reg.register(Box::<ModLoader>::default());
        reg.register(Box::<M15Loader>::default());
        reg
    }

    /// Append a loader. It is probed after every loader already present.
    pub fn register(&mut self, loader: Box<dyn Loader>) {
        self.loaders.push(loader);
    }

    pub fn loaders(&self) -> impl Iterator<Item = &dyn Loader> {
        self.loaders.iter().map(|l| l.as_ref())
    }

    /// One line per loader: tag and description.
    pub fn info(&self) -> String {
        let mut out = String::new();
        for (i, l) in self.loaders.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let _ = write!(out, "{:<4} {}", l.tag(), l.description());
        }
        out
    }

    /// The error of the most recent failed operation, cleared by the next
    /// successful one.
    pub fn last_error(&self) -> Option<ModError> {
        self.last_error
    }

    fn detect(&self, r: &mut dyn ByteReader) -> Option<usize> {
        let found = self.loaders.iter().position(|l| {
            r.rewind_to_start();
            l.test(r)
        });
        r.rewind_to_start();
        found
    }

    /// Tag of the first loader that accepts `r`.
    pub fn identify(&self, r: &mut dyn ByteReader) -> Option<&'static str> {
        self.detect(r).map(|i| self.loaders[i].tag())
    }

    /// Read only the song title.
    pub fn load_title(&mut self, r: &mut dyn ByteReader) -> Option<String> {
        let Some(idx) = self.detect(r) else {
            self.last_error = Some(ModError::NotAModule);
            return None;
        };
        r.rewind_to_start();
        let title = self.loaders[idx].load_title(r);
        self.last_error = if title.is_some() {
            None
        } else {
            Some(ModError::LoadingHeader)
        };
        title
    }

    /// Identify, parse and decode a module.
    pub fn load(
        &mut self,
        r: &mut dyn ByteReader,
        opts: LoadOptions,
    ) -> Result<LoadedModule, ModError> {
        let result = self.load_inner(r, opts);
        self.last_error = result.as_ref().err().copied();
        if let Err(e) = &result {
            log::debug!("[LOADER] load failed: {e}");
        }
        result
    }

    fn load_inner(
        &mut self,
        r: &mut dyn ByteReader,
        opts: LoadOptions,
    ) -> Result<LoadedModule, ModError> {
        let idx = self.detect(r).ok_or(ModError::NotAModule)?;
        let loader = &mut self.loaders[idx];
        let tag = loader.tag();
        log::debug!("[LOADER] detected {tag}");

        let mut of = ModuleBuilder::new();
        let parsed = loader.init().and_then(|()| {
            r.rewind_to_start();
            loader.load(r, &mut of, opts.curious)
        });
        loader.cleanup();
        parsed?;

        let mut module = of.finish();
        finalize(&mut module, opts.max_channels);

        let mut decoder = SampleDecoder::new();
        decoder.register_module(&module);
        if let Some(limit) = opts.sample_memory_limit {
            if !decoder.fit_to(limit) {
                log::warn!("[LOADER] samples do not fit in {limit} bytes");
            }
        }
        let skipped_samples = decoder.decode_all(r, &mut module, opts.sample_policy)?;

        Ok(LoadedModule {
            module,
            loader: tag,
            skipped_samples,
        })
    }
}

/// Post-parse fixups common to every format.
fn finalize(m: &mut Module, max_channels: u8) {
    for (i, s) in m.samples.iter_mut().enumerate() {
        if s.in_flags.is_empty() {
            s.in_flags = s.flags;
        }
        if s.clamp_loop_points() {
            log::warn!("[LOADER] sample {i}: loop points clamped to length {}", s.length);
        }
    }

    if !m.flags.contains(ModuleFlags::PANNING) {
        for (t, pan) in m.panning.iter_mut().take(m.num_channels as usize).enumerate() {
            *pan = if (t + 1) & 2 != 0 {
                PAN_HALFRIGHT
            } else {
                PAN_HALFLEFT
            };
        }
    }

    let mut voices = max_channels;
    if voices > 0 {
        if !m.flags.contains(ModuleFlags::NNA) && m.num_channels < voices {
            voices = m.num_channels;
        } else if m.num_voices > 0 && m.num_voices < voices {
            voices = m.num_voices;
        }
        if voices < m.num_channels {
            m.flags.insert(ModuleFlags::NNA);
        }
        m.real_channels = voices;
    } else {
        m.real_channels = m.num_channels;
    }
}

/// Load a module from an in-memory image with every built-in loader.
pub fn load_module(data: &[u8], opts: LoadOptions) -> Result<LoadedModule, ModError> {
    let mut r = MemReader::new(data);
    Registry::with_all().load(&mut r, opts)
}

/// Read the title of an in-memory module image.
pub fn load_title(data: &[u8]) -> Option<String> {
    let mut r = MemReader::new(data);
    Registry::with_all().load_title(&mut r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use um_ir::Sample;

    #[test]
    fn listing_has_every_loader() {
        let reg = Registry::with_all();
        let info = reg.info();
        assert_eq!(info.lines().count(), 18);
        assert!(info.lines().next().unwrap().starts_with("IT"));
        assert!(info.lines().last().unwrap().starts_with("M15"));
    }

    #[test]
    fn garbage_is_not_a_module() {
        let data = vec![0xaau8; 64];
        let mut reg = Registry::with_all();
        let mut r = MemReader::new(&data);
        assert_eq!(reg.load(&mut r, LoadOptions::default()).err(), Some(ModError::NotAModule));
        assert_eq!(reg.last_error(), Some(ModError::NotAModule));
    }

    #[test]
    fn default_panning_is_half_separated() {
        let mut m = Module {
            num_channels: 4,
            ..Module::default()
        };
        finalize(&mut m, 0);
        assert_eq!(&m.panning[..4], &[64, 192, 192, 64]);
        assert_eq!(m.real_channels, 4);
    }

    #[test]
    fn voice_limit_enables_nna() {
        let mut m = Module {
            num_channels: 8,
            ..Module::default()
        };
        finalize(&mut m, 4);
        assert_eq!(m.real_channels, 4);
        assert!(m.flags.contains(ModuleFlags::NNA));

        let mut m = Module {
            num_channels: 2,
            ..Module::default()
        };
        finalize(&mut m, 16);
        assert_eq!(m.real_channels, 2);
        assert!(!m.flags.contains(ModuleFlags::NNA));
    }

    #[test]
    fn samples_inherit_flags_and_get_clamped() {
        let mut m = Module {
            samples: vec![Sample {
                length: 10,
                loop_end: 20,
                flags: um_ir::SampleFlags::LOOP,
                ..Sample::default()
            }],
            ..Module::default()
        };
        finalize(&mut m, 0);
        assert_eq!(m.samples[0].in_flags, um_ir::SampleFlags::LOOP);
        assert_eq!(m.samples[0].loop_end, 10);
    }
}
