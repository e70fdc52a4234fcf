pub mod ast;
pub mod disk;
pub mod environment;
pub mod index_cache;
pub mod key;
pub mod stats;
pub mod store;

pub use ast::*;
pub use disk::*;
pub use environment::*;
pub use index_cache::*;
pub use key::*;
pub use stats::*;
pub use store::*;

// Re-export common types for convenience
pub use beanscan_core::{Fingerprint, Result, ScanError};
