//! Track event opcodes.

/// Event opcode. Value 0 is never emitted: it would collide with the track
/// terminator.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Note = 1,
    Instrument,
    PtEffect0,
    PtEffect1,
    PtEffect2,
    PtEffect3,
    PtEffect4,
    PtEffect5,
    PtEffect6,
    PtEffect7,
    PtEffect8,
    PtEffect9,
    PtEffectA,
    PtEffectB,
    PtEffectC,
    PtEffectD,
    PtEffectE,
    PtEffectF,
    S3mEffectA,
    S3mEffectD,
    S3mEffectE,
    S3mEffectF,
    S3mEffectI,
    S3mEffectQ,
    S3mEffectR,
    S3mEffectT,
    S3mEffectU,
    KeyOff,
    KeyFade,
    VolEffects,
    XmEffect4,
    XmEffect6,
    XmEffectA,
    XmEffectE1,
    XmEffectE2,
    XmEffectEA,
    XmEffectEB,
    XmEffectG,
    XmEffectH,
    XmEffectL,
    XmEffectP,
    XmEffectX1,
    XmEffectX2,
    ItEffectG,
    ItEffectH,
    ItEffectI,
    ItEffectM,
    ItEffectN,
    ItEffectP,
    ItEffectT,
    ItEffectU,
    ItEffectW,
    ItEffectY,
    ItEffectZ,
    ItEffectS0,
    UltEffect9,
    MedSpeed,
    MedEffectF1,
    MedEffectF2,
    MedEffectF3,
    OktArp,
}

/// One past the highest valid opcode value.
pub const OPCODE_LAST: u8 = Opcode::OktArp as u8 + 1;

const ALL: [Opcode; OPCODE_LAST as usize - 1] = {
    use Opcode::*;
    [
        Note, Instrument, PtEffect0, PtEffect1, PtEffect2, PtEffect3, PtEffect4, PtEffect5,
        PtEffect6, PtEffect7, PtEffect8, PtEffect9, PtEffectA, PtEffectB, PtEffectC, PtEffectD,
        PtEffectE, PtEffectF, S3mEffectA, S3mEffectD, S3mEffectE, S3mEffectF, S3mEffectI,
        S3mEffectQ, S3mEffectR, S3mEffectT, S3mEffectU, KeyOff, KeyFade, VolEffects, XmEffect4,
        XmEffect6, XmEffectA, XmEffectE1, XmEffectE2, XmEffectEA, XmEffectEB, XmEffectG,
        XmEffectH, XmEffectL, XmEffectP, XmEffectX1, XmEffectX2, ItEffectG, ItEffectH,
        ItEffectI, ItEffectM, ItEffectN, ItEffectP, ItEffectT, ItEffectU, ItEffectW, ItEffectY,
        ItEffectZ, ItEffectS0, UltEffect9, MedSpeed, MedEffectF1, MedEffectF2, MedEffectF3,
        OktArp,
    ]
};

impl Opcode {
    /// Decode an opcode byte.
    pub fn from_u8(value: u8) -> Option<Opcode> {
        if value == 0 {
            return None;
        }
        ALL.get(value as usize - 1).copied()
    }

    /// The Protracker effect opcode for effect nibble `eff` (0-15).
    pub fn pt_effect(eff: u8) -> Option<Opcode> {
        if eff < 0x10 {
            Opcode::from_u8(Opcode::PtEffect0 as u8 + eff)
        } else {
            None
        }
    }

    /// Number of operand bytes following the opcode.
    pub fn operand_width(self) -> usize {
        match self {
            Opcode::KeyOff | Opcode::MedEffectF1 | Opcode::MedEffectF2 | Opcode::MedEffectF3 => 0,
            Opcode::VolEffects
            | Opcode::ItEffectZ
            | Opcode::UltEffect9
            | Opcode::MedSpeed
            | Opcode::OktArp => 2,
            _ => 1,
        }
    }
}

/// Sub-commands of [`Opcode::VolEffects`] (IT volume column).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolEffect {
    Volume = 1,
    Panning,
    VolSlide,
    PitchSlideDown,
    PitchSlideUp,
    Portamento,
    Vibrato,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_are_stable() {
        assert_eq!(Opcode::Note as u8, 1);
        assert_eq!(Opcode::PtEffect0 as u8, 3);
        assert_eq!(Opcode::PtEffectF as u8, 18);
        assert_eq!(Opcode::KeyOff as u8, 28);
        assert_eq!(Opcode::VolEffects as u8, 30);
        assert_eq!(Opcode::ItEffectZ as u8, 54);
        assert_eq!(Opcode::OktArp as u8, 61);
        assert_eq!(OPCODE_LAST, 62);
    }

    #[test]
    fn from_u8_covers_every_opcode() {
        assert_eq!(Opcode::from_u8(0), None);
        assert_eq!(Opcode::from_u8(OPCODE_LAST), None);
        for v in 1..OPCODE_LAST {
            let op = Opcode::from_u8(v).unwrap();
            assert_eq!(op as u8, v);
        }
    }

    #[test]
    fn pt_effect_lookup() {
        assert_eq!(Opcode::pt_effect(0xc), Some(Opcode::PtEffectC));
        assert_eq!(Opcode::pt_effect(0x10), None);
    }

    #[test]
    fn operand_widths() {
        assert_eq!(Opcode::KeyOff.operand_width(), 0);
        assert_eq!(Opcode::Note.operand_width(), 1);
        assert_eq!(Opcode::UltEffect9.operand_width(), 2);
        assert_eq!(Opcode::MedEffectF3.operand_width(), 0);
    }
}
