pub mod dataset;
pub mod error;
pub mod index;
pub mod pipeline;
pub mod settings;
pub mod store;
pub mod tagger;
pub mod zones;

pub use error::{Error, Result};
pub use index::{Classification, ZoneIndex};
pub use pipeline::Orchestrator;
pub use settings::Settings;
pub use store::{VersionRef, VersionStore};
pub use zones::Configuration;
