//! Bit flags carried by modules, samples, instruments and envelopes.

use bitflags::bitflags;

bitflags! {
    /// Playback behavior flags for a whole module.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ModuleFlags: u16 {
        /// Periods come from the XM table (linear or logarithmic).
        const XM_PERIODS = 0x0001;
        /// Linear frequency slides.
        const LINEAR = 0x0002;
        /// Instruments are in use, not only samples.
        const INST = 0x0004;
        /// New note actions are in effect.
        const NNA = 0x0008;
        /// Scream Tracker volume slide quirks.
        const S3M_SLIDES = 0x0010;
        /// Effects keep running in the background on NNA voices.
        const BG_SLIDES = 0x0020;
        /// Tempo may exceed 255.
        const HIGH_BPM = 0x0040;
        /// Song does not wrap around at the end.
        const NO_WRAP = 0x0080;
        /// Arpeggio has effect memory.
        const ARPMEM = 0x0100;
        /// FastTracker 2 specific behavior.
        const FT2_QUIRKS = 0x0200;
        /// Module supplies its own channel panning.
        const PANNING = 0x0400;
    }
}

bitflags! {
    /// Sample storage and loop flags.
    ///
    /// The low byte describes the stored encoding and is only meaningful
    /// before the sample data has been decoded; the high byte describes
    /// playback behavior.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SampleFlags: u16 {
        const BITS16 = 0x0001;
        const STEREO = 0x0002;
        const SIGNED = 0x0004;
        const BIG_ENDIAN = 0x0008;
        const DELTA = 0x0010;
        const ITPACKED = 0x0020;

        const LOOP = 0x0100;
        const BIDI = 0x0200;
        const REVERSE = 0x0400;
        const SUSTAIN = 0x0800;
        const OWN_PAN = 0x1000;
        const UST_LOOP = 0x2000;
    }
}

impl SampleFlags {
    /// Flags describing the stored encoding.
    pub const FORMAT_MASK: SampleFlags = SampleFlags::from_bits_truncate(0x003f);
    /// Flags describing playback behavior.
    pub const PLAYBACK_MASK: SampleFlags = SampleFlags::from_bits_truncate(0x3f00);
}

bitflags! {
    /// Envelope state flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EnvelopeFlags: u8 {
        const ON = 0x01;
        const SUSTAIN = 0x02;
        const LOOP = 0x04;
        /// Volume envelope with IT semantics (fade on envelope end).
        const VOLENV = 0x08;
    }
}

bitflags! {
    /// Instrument flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct InstrumentFlags: u8 {
        /// Instrument panning overrides channel panning.
        const OWN_PAN = 0x01;
        /// Pitch-pan separation is active.
        const PITCH_PAN = 0x02;
    }
}
