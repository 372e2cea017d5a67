//! Effect translation shared by several loaders.
//!
//! Scream Tracker 3, Impulse Tracker and the formats derived from them
//! number their commands A-Z; [`S3mItState::process_cmd`] maps those onto
//! the UniTrk vocabulary. The state also owns the order-list compaction
//! that lets `Bxx` jumps be re-targeted after skip markers are removed,
//! and the resonant filter macros driven by `Zxx`/`SFx`.

use um_ir::{ModuleBuilder, Opcode, LAST_PATTERN};

/// Commands follow Scream Tracker rather than Impulse Tracker semantics.
pub const OLDSTYLE: u8 = 1;
/// Module was written by Impulse Tracker.
pub const IT: u8 = 2;
/// Module was written by Scream Tracker proper.
pub const SCREAM: u8 = 4;

pub const FILT_CUT: u8 = 0x80;
pub const FILT_RESONANT: u8 = 0x81;

/// Source order value for end of song.
const ORDER_END: u8 = 255;
/// Source order value for a skip marker.
const ORDER_SKIP: u8 = 254;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterSetting {
    pub filter: u8,
    pub inf: u8,
}

/// Per-load state for S3M-style command translation.
#[derive(Clone, Debug)]
pub struct S3mItState {
    /// Order list as stored in the file, 254/255 markers included.
    pub orig_positions: Vec<u8>,
    /// Source position to compacted position.
    pub pos_lookup: Vec<Option<u8>>,
    /// Source channel to module channel, `None` for unused channels.
    pub remap: [Option<u8>; 64],
    /// Embedded filter macros are active.
    pub filters: bool,
    active_macro: u8,
    pub filter_macros: [u8; 16],
    pub filter_settings: [FilterSetting; 256],
}

impl Default for S3mItState {
    fn default() -> Self {
        Self::new()
    }
}

impl S3mItState {
    pub fn new() -> Self {
        Self {
            orig_positions: Vec::new(),
            pos_lookup: vec![None; 256],
            remap: [None; 64],
            filters: false,
            active_macro: 0,
            filter_macros: [0; 16],
            filter_settings: [FilterSetting::default(); 256],
        }
    }

    /// Default macro set used when a module carries no MIDI
    /// configuration: `Z00-Z7F` set the cutoff, `Z80-Z8F` the resonance.
    pub fn default_filters(&mut self) {
        self.filter_macros = [0; 16];
        self.filter_macros[0] = FILT_CUT;
        for i in 0x80..0x90 {
            self.filter_settings[i] = FilterSetting {
                filter: FILT_RESONANT,
                inf: ((i & 0x7f) << 3) as u8,
            };
        }
        self.select_first_macro();
    }

    /// Make macro 0 active: `Z00-Z7F` then drive it with the parameter.
    pub fn select_first_macro(&mut self) {
        self.active_macro = 0;
        for i in 0..0x80 {
            self.filter_settings[i] = FilterSetting {
                filter: self.filter_macros[0],
                inf: i as u8,
            };
        }
    }

    /// Build the module order list from `orig_positions`. Skip markers are
    /// dropped. Unless `curious`, the list ends at the first end marker;
    /// curious mode reads past one end marker.
    pub fn create_orders(&mut self, of: &mut ModuleBuilder, curious: bool) {
        let count = self.orig_positions.len();
        of.num_positions = 0;
        of.positions.clear();
        of.positions.resize(count, 0);
        self.pos_lookup.iter_mut().for_each(|p| *p = None);

        let mut grace = curious;
        for t in 0..count {
            let orig = self.orig_positions[t];
            let order = if orig == ORDER_END { LAST_PATTERN } else { orig as u16 };
            let pos = of.num_positions as usize;
            of.positions[pos] = order;
            if let Some(slot) = self.pos_lookup.get_mut(t) {
                *slot = Some(pos as u8);
            }
            if orig < ORDER_SKIP {
                of.num_positions += 1;
            } else if order == LAST_PATTERN {
                if !grace {
                    break;
                }
                grace = false;
            }
        }
    }

    /// Translate command `cmd` (1 = A ... 26 = Z) with parameter `inf`.
    pub fn process_cmd(&mut self, of: &mut ModuleBuilder, cmd: u8, inf: u8, style: u8) {
        let lo = inf & 0xf;
        let old = style & OLDSTYLE != 0;
        match cmd {
            1 => of.uni.effect(Opcode::S3mEffectA, inf as u16),
            2 => {
                let t = inf as usize;
                if t < self.orig_positions.len() {
                    if self.pos_lookup[t].is_none() && self.orig_positions[t] != ORDER_END {
                        self.create_orders(of, true);
                    }
                    if let Some(pos) = self.pos_lookup[t] {
                        of.pt_effect(0xb, pos);
                    }
                }
            }
            3 => {
                if old && style & IT == 0 {
                    of.pt_effect(0xd, (inf >> 4) * 10 + lo);
                } else {
                    of.pt_effect(0xd, inf);
                }
            }
            4 => of.uni.effect(Opcode::S3mEffectD, inf as u16),
            5 => of.uni.effect(Opcode::S3mEffectE, inf as u16),
            6 => of.uni.effect(Opcode::S3mEffectF, inf as u16),
            7 => {
                if old {
                    of.pt_effect(0x3, inf);
                } else {
                    of.uni.effect(Opcode::ItEffectG, inf as u16);
                }
            }
            8 => {
                if old {
                    of.pt_effect(0x4, inf);
                } else {
                    of.uni.effect(Opcode::ItEffectH, inf as u16);
                }
            }
            9 => {
                let op = if old { Opcode::S3mEffectI } else { Opcode::ItEffectI };
                of.uni.effect(op, inf as u16);
            }
            0xa => of.pt_effect(0x0, inf),
            0xb => {
                if old {
                    of.pt_effect(0x4, 0);
                } else {
                    of.uni.effect(Opcode::ItEffectH, 0);
                }
                of.uni.effect(Opcode::S3mEffectD, inf as u16);
            }
            0xc => {
                if old {
                    of.pt_effect(0x3, 0);
                } else {
                    of.uni.effect(Opcode::ItEffectG, 0);
                }
                of.uni.effect(Opcode::S3mEffectD, inf as u16);
            }
            0xd => of.uni.effect(Opcode::ItEffectM, inf as u16),
            0xe => of.uni.effect(Opcode::ItEffectN, inf as u16),
            0xf => of.pt_effect(0x9, inf),
            0x10 => of.uni.effect(Opcode::ItEffectP, inf as u16),
            0x11 => {
                let dat = if inf != 0 && lo == 0 && !old { 1 } else { inf };
                of.uni.effect(Opcode::S3mEffectQ, dat as u16);
            }
            0x12 => of.uni.effect(Opcode::S3mEffectR, inf as u16),
            0x13 => {
                if inf >= 0xf0 {
                    if self.filters && lo != self.active_macro {
                        self.active_macro = lo;
                        let filter = self.filter_macros[lo as usize];
                        for s in &mut self.filter_settings[..0x80] {
                            s.filter = filter;
                        }
                    }
                } else if !(style & SCREAM != 0 && inf & 0xf0 == 0xa0) {
                    // Scream Tracker has no samples past 64k, so no SAx
                    of.uni.effect(Opcode::ItEffectS0, inf as u16);
                }
            }
            0x14 => {
                if inf >= 0x20 {
                    of.uni.effect(Opcode::S3mEffectT, inf as u16);
                } else if !old {
                    of.uni.effect(Opcode::ItEffectT, inf as u16);
                }
            }
            0x15 => {
                let op = if old { Opcode::S3mEffectU } else { Opcode::ItEffectU };
                of.uni.effect(op, inf as u16);
            }
            0x16 => of.uni.effect(Opcode::XmEffectG, inf as u16),
            0x17 => of.uni.effect(Opcode::ItEffectW, inf as u16),
            0x18 => {
                if old {
                    if inf > 128 {
                        of.uni.effect(Opcode::ItEffectS0, 0x91);
                    } else {
                        of.pt_effect(0x8, if inf == 128 { 255 } else { inf << 1 });
                    }
                } else {
                    of.pt_effect(0x8, inf);
                }
            }
            0x19 => of.uni.effect(Opcode::ItEffectY, inf as u16),
            0x1a => {
                let s = self.filter_settings[inf as usize];
                if s.filter != 0 {
                    of.uni.effect2(Opcode::ItEffectZ, s.filter, s.inf);
                }
            }
            _ => {}
        }
    }
}

/// Normalize a Protracker effect parameter: pattern break rows are BCD,
/// a volume slide with both nibbles set keeps only the slide up, and set
/// volume is capped at 64.
pub fn pt_param(eff: u8, dat: u8) -> u8 {
    match eff {
        0xa if dat & 0xf0 != 0 => dat & 0xf0,
        0xc => dat.min(0x40),
        0xd => (dat >> 4) * 10 + (dat & 0xf),
        _ => dat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder_with_positions(n: usize) -> ModuleBuilder {
        let mut of = ModuleBuilder::new();
        of.alloc_positions(n).unwrap();
        of
    }

    #[test]
    fn strict_orders_stop_at_end_marker() {
        let mut of = builder_with_positions(4);
        let mut st = S3mItState::new();
        st.orig_positions = vec![0, 255, 0, 0];
        st.create_orders(&mut of, false);
        assert_eq!(of.num_positions, 1);
        assert_eq!(of.order(), &[0]);
    }

    #[test]
    fn curious_orders_read_past_one_end_marker() {
        let mut of = builder_with_positions(4);
        let mut st = S3mItState::new();
        st.orig_positions = vec![0, 255, 0, 0];
        st.create_orders(&mut of, true);
        assert_eq!(of.num_positions, 3);
    }

    #[test]
    fn skip_markers_are_compacted() {
        let mut of = builder_with_positions(4);
        let mut st = S3mItState::new();
        st.orig_positions = vec![1, 254, 2, 255];
        st.create_orders(&mut of, false);
        assert_eq!(of.order(), &[1, 2]);
        assert_eq!(st.pos_lookup[2], Some(1));
    }

    #[test]
    fn position_jump_uses_compacted_index() {
        let mut of = builder_with_positions(3);
        let mut st = S3mItState::new();
        st.orig_positions = vec![0, 254, 1];
        st.create_orders(&mut of, false);
        of.uni.reset();
        st.process_cmd(&mut of, 2, 2, OLDSTYLE);
        of.uni.newline();
        let track = of.uni.finish();
        let ev: Vec<_> = track.rows().next().unwrap().events().collect();
        assert_eq!(ev[0].opcode, Opcode::PtEffectB);
        assert_eq!(ev[0].operand, 1);
    }

    #[test]
    fn scream_pattern_break_is_bcd() {
        let mut of = ModuleBuilder::new();
        let mut st = S3mItState::new();
        of.uni.reset();
        st.process_cmd(&mut of, 3, 0x12, OLDSTYLE);
        st.process_cmd(&mut of, 3, 0x12, OLDSTYLE | IT);
        of.uni.newline();
        let track = of.uni.finish();
        let ops: Vec<u16> = track.rows().next().unwrap().events().map(|e| e.operand).collect();
        assert_eq!(ops, vec![12, 0x12]);
    }

    #[test]
    fn zxx_uses_default_macros() {
        let mut of = ModuleBuilder::new();
        let mut st = S3mItState::new();
        st.default_filters();
        of.uni.reset();
        st.process_cmd(&mut of, 0x1a, 0x81, 0);
        of.uni.newline();
        let track = of.uni.finish();
        let ev: Vec<_> = track.rows().next().unwrap().events().collect();
        assert_eq!(ev[0].opcode, Opcode::ItEffectZ);
        assert_eq!(ev[0].operand, u16::from_be_bytes([FILT_RESONANT, 8]));
    }

    #[test]
    fn protracker_parameters() {
        assert_eq!(pt_param(0xa, 0x35), 0x30);
        assert_eq!(pt_param(0xa, 0x05), 0x05);
        assert_eq!(pt_param(0xc, 0x50), 0x40);
        assert_eq!(pt_param(0xd, 0x21), 21);
        assert_eq!(pt_param(0x1, 0x21), 0x21);
    }
}
