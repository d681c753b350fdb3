pub mod cache;
pub mod config;
pub mod error;
pub mod monitoring;
pub mod recovery;
pub mod service;

pub use cache::{CacheManager, CacheOptimizer};
pub use config::CoreConfig;
pub use error::{CoreError, CoreResult, RecoveryError};
pub use recovery::{ErrorRecoveryManager, Recovered, RecoveryContext};
pub use service::ResilienceCore;
