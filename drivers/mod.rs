// Backend package / 后端驱动包
pub mod s3;

use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::storage::{BackendRef, MemoryBackend};

/// Build the backend named by `config.provider` / 按配置创建后端
pub fn create_backend(config: &StorageConfig) -> Result<BackendRef> {
    let backend: BackendRef = match config.provider.as_str() {
        // S3-compatible service (AWS, MinIO, Magalu, OSS...) / S3兼容服务
        "s3" => Arc::new(s3::S3Backend::new(config)?),
        // In-process emulation / 内存模拟
        "memory" => Arc::new(MemoryBackend::new(config)),
        other => {
            return Err(StorageError::InvalidConfig(format!(
                "unknown storage provider: {}",
                other
            )))
        }
    };
    tracing::info!("Storage backend created: {}", backend.name());
    Ok(backend)
}
