//! The format loader interface and load options.

use um_ir::{ModError, Module, ModuleBuilder};

use crate::reader::ByteReader;
use crate::samples::SamplePolicy;

/// One tracker format.
///
/// The registry drives every loader through the same sequence: `test` on a
/// rewound stream, then `init`, `load` (again from offset 0) and
/// `cleanup`. `cleanup` runs whatever the outcome of `init` and `load`.
pub trait Loader {
    /// Short format tag ("MOD", "S3M", ...).
    fn tag(&self) -> &'static str;

    /// One-line description for format listings.
    fn description(&self) -> &'static str;

    /// Check the signature at the start of `r`. Must not depend on state
    /// left behind by an earlier call.
    fn test(&self, r: &mut dyn ByteReader) -> bool;

    /// Allocate per-load scratch state.
    fn init(&mut self) -> Result<(), ModError> {
        Ok(())
    }

    /// Parse the whole module into `of`. `curious` enables the permissive
    /// readings of known-buggy files.
    fn load(
        &mut self,
        r: &mut dyn ByteReader,
        of: &mut ModuleBuilder,
        curious: bool,
    ) -> Result<(), ModError>;

    /// Release per-load scratch state.
    fn cleanup(&mut self) {}

    /// Read only the song title.
    fn load_title(&self, r: &mut dyn ByteReader) -> Option<String>;
}

/// Caller-controlled knobs for a module load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Voice budget of the player, 0 for no limit.
    pub max_channels: u8,
    pub curious: bool,
    pub sample_policy: SamplePolicy,
    /// Decimate samples until the decoded total fits, in bytes.
    pub sample_memory_limit: Option<usize>,
}

impl LoadOptions {
    pub fn curious(mut self, curious: bool) -> Self {
        self.curious = curious;
        self
    }

    pub fn max_channels(mut self, max: u8) -> Self {
        self.max_channels = max;
        self
    }

    pub fn sample_policy(mut self, policy: SamplePolicy) -> Self {
        self.sample_policy = policy;
        self
    }

    pub fn sample_memory_limit(mut self, limit: usize) -> Self {
        self.sample_memory_limit = Some(limit);
        self
    }
}

/// Result of a successful load.
#[derive(Clone, Debug)]
pub struct LoadedModule {
    pub module: Module,
    /// Tag of the loader that accepted the file.
    pub loader: &'static str,
    /// Samples left empty under [`SamplePolicy::SkipBad`].
    pub skipped_samples: Vec<usize>,
}
