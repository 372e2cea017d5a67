//! Load error taxonomy shared by all format parsers.

use thiserror::Error;

/// Error produced while identifying, parsing or decoding a module.
///
/// Each variant carries a stable numeric [`code`](ModError::code) so that
/// callers holding on to a load context can report the last failure without
/// keeping the error value itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ModError {
    #[error("Unknown module format")]
    NotAModule,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Error loading header")]
    LoadingHeader,
    #[error("Error loading pattern")]
    LoadingPattern,
    #[error("Error loading track")]
    LoadingTrack,
    #[error("Error loading sampleinfo")]
    LoadingSampleInfo,
    #[error("Error loading sample data")]
    LoadingSamples,
    #[error("Compressed sample is invalid")]
    ItPackInvalidData,
    #[error("Unsupported feature: {0}")]
    NotSupported(&'static str),
}

impl ModError {
    /// Stable numeric code for this error kind.
    pub fn code(&self) -> u16 {
        match self {
            ModError::OutOfMemory => 2,
            ModError::LoadingPattern => 7,
            ModError::LoadingTrack => 8,
            ModError::LoadingHeader => 9,
            ModError::LoadingSampleInfo => 10,
            ModError::NotAModule => 11,
            ModError::ItPackInvalidData => 14,
            ModError::LoadingSamples => 15,
            ModError::NotSupported(_) => 16,
        }
    }

    /// Human-readable message for a numeric error code.
    pub fn message(code: u16) -> &'static str {
        match code {
            2 => "Out of memory",
            7 => "Error loading pattern",
            8 => "Error loading track",
            9 => "Error loading header",
            10 => "Error loading sampleinfo",
            11 => "Unknown module format",
            14 => "Compressed sample is invalid",
            15 => "Error loading sample data",
            16 => "Unsupported feature",
            _ => "Unknown error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn codes_are_distinct() {
        let all = [
            ModError::NotAModule,
            ModError::OutOfMemory,
            ModError::LoadingHeader,
            ModError::LoadingPattern,
            ModError::LoadingTrack,
            ModError::LoadingSampleInfo,
            ModError::LoadingSamples,
            ModError::ItPackInvalidData,
            ModError::NotSupported("x"),
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code(), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn code_to_message() {
        assert_eq!(ModError::message(ModError::LoadingPattern.code()), "Error loading pattern");
        assert_eq!(ModError::message(999), "Unknown error");
    }

    #[test]
    fn message_text() {
        assert_eq!(ModError::NotAModule.to_string(), "Unknown module format");
        assert_eq!(
            ModError::NotSupported("filter envelopes").to_string(),
            "Unsupported feature: filter envelopes"
        );
    }
}
