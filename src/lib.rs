pub mod archive;
pub mod config;
pub mod container;
pub mod host;
pub mod layer;
pub mod local_file;
pub mod metadata;
pub mod notifier;
pub mod repository;
pub mod structure;
pub mod unique;

// Re-exports for easy access
pub use archive::{CommandRunner, Extractor, ProcessRunner};
pub use config::{Config, ExtractorKind};
pub use local_file::LocalFileApi;
pub use metadata::ContainerMeta;
pub use notifier::Notifier;
pub use repository::{ContainerStore, LocalRepository, Repository};
pub use structure::{ImageStructure, OciImage};
