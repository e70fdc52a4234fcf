pub mod config;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use config::*;
pub use error::*;
pub use fingerprint::*;
pub use traits::*;
pub use types::*;
