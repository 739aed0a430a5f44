//! Gateway error taxonomy / 网关错误类型

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage gateway error / 存储网关错误
///
/// "Not found" on the read path is never represented here: `download` returns
/// `None` and `exists` returns `false` instead.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Bucket could not be verified or created / 存储桶不可用
    #[error("bucket unavailable: {0}")]
    BucketUnavailable(String),

    /// Neither the caller nor the config named a bucket / 未指定存储桶
    #[error("no bucket given and no default bucket configured")]
    EmptyBucket,

    /// Empty object key would address the bucket itself / 对象键为空
    #[error("object key is empty")]
    EmptyKey,

    #[error("invalid base64 content: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),

    #[error("cannot read source file {}: {source}", .path.display())]
    SourceFileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Non-success response from the storage service / 服务端返回错误
    #[error("storage service returned {status}: {message}")]
    Service { status: u16, message: String },

    /// Network, signing or client-side failure / 传输错误
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Illegal multipart transition or incomplete part list / 分片上传状态错误
    #[error("multipart upload error: {0}")]
    MultipartState(String),
}

impl StorageError {
    pub fn service(status: u16, message: impl Into<String>) -> Self {
        StorageError::Service {
            status,
            message: message.into(),
        }
    }

    /// Whether the service reported the target as missing / 是否为"不存在"
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::Service { status: 404, .. })
    }
}

impl From<s3::error::S3Error> for StorageError {
    fn from(err: s3::error::S3Error) -> Self {
        match err {
            s3::error::S3Error::HttpFailWithBody(status, body) => StorageError::service(status, body),
            other => StorageError::Transport(other.to_string()),
        }
    }
}
