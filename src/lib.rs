pub mod config;
pub mod error;
pub mod storage;
pub mod utils;

// Backend drivers (point to project root drivers via path attribute) / 后端驱动模块
#[path = "../drivers/mod.rs"]
pub mod drivers;

pub use config::StorageConfig;
pub use error::{Result, StorageError};
pub use storage::BlobStorage;
