//! Tracker module loaders for unimod.
//!
//! Parses MOD, S3M, XM, IT, MED, and a dozen other tracker formats into
//! the [`um_ir::Module`] model, then decodes the sample data.

pub mod common;
pub mod effects;
pub mod loader;
pub mod reader;
pub mod registry;
pub mod samples;

mod amf_format;
mod dsm_format;
mod far_format;
mod gdm_format;
mod imf_format;
mod it_format;
mod m15_format;
mod med_format;
mod mod_format;
mod mtm_format;
mod okt_format;
mod s3m_format;
mod s669_format;
mod stm_format;
mod stx_format;
mod ult_format;
mod uni_format;
mod xm_format;

pub use amf_format::AmfLoader;
pub use dsm_format::DsmLoader;
pub use far_format::FarLoader;
pub use gdm_format::GdmLoader;
pub use imf_format::ImfLoader;
pub use it_format::ItLoader;
pub use m15_format::M15Loader;
pub use med_format::MedLoader;
pub use mod_format::ModLoader;
pub use mtm_format::MtmLoader;
pub use okt_format::OktLoader;
pub use s3m_format::S3mLoader;
pub use s669_format::S69Loader;
pub use stm_format::StmLoader;
pub use stx_format::StxLoader;
pub use ult_format::UltLoader;
pub use uni_format::UniLoader;
pub use xm_format::XmLoader;

pub use loader::{LoadOptions, LoadedModule, Loader};
pub use reader::{ByteReader, MemReader, StreamReader};
pub use registry::{load_module, load_title, Registry};
pub use samples::{SampleLoadRequest, SamplePolicy};

pub use um_ir::ModError;
