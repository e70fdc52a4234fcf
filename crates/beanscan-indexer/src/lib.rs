pub mod content;
pub mod debounce;
pub mod dependency;
pub mod engine;
pub mod factories;
pub mod files;
pub mod queue;
pub mod registry;
mod scan;
pub mod service;
pub mod traits;
pub mod watch;

pub use content::*;
pub use debounce::*;
pub use dependency::*;
pub use engine::*;
pub use factories::FactoriesIndexer;
pub use files::{ProjectFiles, SourceScope};
pub use queue::*;
pub use registry::*;
pub use service::*;
pub use traits::*;
pub use watch::*;

// Re-export common types for convenience
pub use beanscan_core::{IndexEvent, IndexerConfig, Project, Result, ScanError};
