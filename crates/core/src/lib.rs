pub mod config;
pub mod error;
pub mod track;

pub use config::ExtractorConfig;
pub use error::{Error, Result};
pub use track::{TrackDescriptor, TrackMetadata};
