//! Core representation for the unimod loader.
//!
//! Every supported tracker format is converted into a single [`Module`]:
//! song metadata, an order list, a pattern table mapping (pattern, channel)
//! to a track, per-channel tracks encoded as UniTrk bytecode, instruments
//! and samples. Format parsers build that model through a
//! [`ModuleBuilder`], which also owns the track writer.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod builder;
pub mod error;
pub mod flags;
pub mod instrument;
pub mod module;
pub mod periods;
pub mod sample;
pub mod unitrk;

pub use builder::ModuleBuilder;
pub use error::ModError;
pub use flags::{EnvelopeFlags, InstrumentFlags, ModuleFlags, SampleFlags};
pub use instrument::{
    DuplicateAction, DuplicateCheck, EnvPoint, Envelope, Instrument, NewNoteAction, ENVPOINTS,
    INSTNOTES,
};
pub use module::{
    Module, LAST_PATTERN, MAX_CHANNELS, PAN_CENTER, PAN_HALFLEFT, PAN_HALFRIGHT, PAN_LEFT,
    PAN_RIGHT, PAN_SURROUND, POS_SKIP,
};
pub use sample::{AutoVibrato, Sample};
pub use unitrk::{Event, Opcode, Row, RowCursor, Track, TrackWriter, VolEffect};
