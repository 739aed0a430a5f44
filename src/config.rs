//! Storage configuration module / 存储配置模块
//!
//! Loaded once at startup from a JSON file and/or `BLOBGATE_*` environment
//! variables, then handed to the gateway as an immutable value.
//! 启动时从 JSON 文件或环境变量加载，之后不可变

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, StorageError};

/// Reference multipart chunk size (5 MiB) / 参考分片大小
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Storage connection parameters / 存储连接参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend provider: "s3" or "memory" / 后端类型
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Service endpoint, with or without scheme / 服务端点
    /// AWS: https://s3.{region}.amazonaws.com
    /// MinIO: http://localhost:9000
    #[serde(default)]
    pub service_url: String,
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    /// Region (optional, most S3-compatible services ignore it) / 区域
    #[serde(default)]
    pub region: Option<String>,
    /// Bucket used when the caller passes no container / 默认存储桶
    #[serde(default)]
    pub default_bucket: Option<String>,
    /// Scheme used when the endpoint carries none / 端点无协议时是否使用 HTTPS
    #[serde(default = "default_true")]
    pub use_https: bool,
    /// Path-style addressing, required by MinIO and most non-AWS services / 强制路径风格
    #[serde(default = "default_true")]
    pub force_path_style: bool,
    /// Upper bound for any single remote request (ms) / 单次请求超时（毫秒）
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub multipart_chunk_size: usize,
    /// Parts in flight per multipart upload / 分片并发数
    #[serde(default = "default_concurrency")]
    pub multipart_concurrency: usize,
    /// Abort the session when a part fails / 分片失败时中止会话
    #[serde(default = "default_true")]
    pub abort_multipart_on_failure: bool,
}

fn default_provider() -> String {
    "s3".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    100_000
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_concurrency() -> usize {
    2
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            service_url: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            region: None,
            default_bucket: None,
            use_https: true,
            force_path_style: true,
            timeout_ms: default_timeout_ms(),
            multipart_chunk_size: default_chunk_size(),
            multipart_concurrency: default_concurrency(),
            abort_multipart_on_failure: true,
        }
    }
}

impl StorageConfig {
    /// In-process configuration backed by `MemoryBackend` / 内存后端配置
    pub fn memory(default_bucket: &str) -> Self {
        Self {
            provider: "memory".to_string(),
            service_url: "http://localhost:9000".to_string(),
            access_key_id: "memory".to_string(),
            secret_access_key: "memory-secret".to_string(),
            default_bucket: Some(default_bucket.to_string()),
            ..Self::default()
        }
    }

    /// Build configuration purely from environment variables / 从环境变量构建配置
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Overlay `BLOBGATE_*` variables onto this config / 用环境变量覆盖配置
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_var("BLOBGATE_PROVIDER") {
            self.provider = v;
        }
        if let Some(v) = env_var("BLOBGATE_SERVICE_URL") {
            self.service_url = v;
        }
        if let Some(v) = env_var("BLOBGATE_ACCESS_KEY_ID") {
            self.access_key_id = v;
        }
        if let Some(v) = env_var("BLOBGATE_SECRET_ACCESS_KEY") {
            self.secret_access_key = v;
        }
        if let Some(v) = env_var("BLOBGATE_REGION") {
            self.region = Some(v);
        }
        if let Some(v) = env_var("BLOBGATE_DEFAULT_BUCKET") {
            self.default_bucket = Some(v);
        }
        if let Some(v) = env_var("BLOBGATE_USE_HTTPS") {
            self.use_https = parse_env("BLOBGATE_USE_HTTPS", &v)?;
        }
        if let Some(v) = env_var("BLOBGATE_FORCE_PATH_STYLE") {
            self.force_path_style = parse_env("BLOBGATE_FORCE_PATH_STYLE", &v)?;
        }
        if let Some(v) = env_var("BLOBGATE_TIMEOUT_MS") {
            self.timeout_ms = parse_env("BLOBGATE_TIMEOUT_MS", &v)?;
        }
        Ok(())
    }

    /// Check invariants before building a gateway / 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(StorageError::InvalidConfig("timeout_ms must be positive".into()));
        }
        if self.multipart_chunk_size == 0 {
            return Err(StorageError::InvalidConfig(
                "multipart_chunk_size must be positive".into(),
            ));
        }
        if self.multipart_concurrency == 0 {
            return Err(StorageError::InvalidConfig(
                "multipart_concurrency must be positive".into(),
            ));
        }
        if self.provider == "s3" {
            if self.service_url.trim().is_empty() {
                return Err(StorageError::InvalidConfig("service_url is required".into()));
            }
            if self.access_key_id.is_empty() || self.secret_access_key.is_empty() {
                return Err(StorageError::InvalidConfig(
                    "access_key_id and secret_access_key are required".into(),
                ));
            }
        }
        Ok(())
    }

    /// Effective region, AWS default when unset / 实际区域
    pub fn region(&self) -> String {
        match self.region.as_deref().map(str::trim) {
            Some(r) if !r.is_empty() => r.to_string(),
            _ => "us-east-1".to_string(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Configured default bucket, empty string when unset / 默认存储桶
    pub fn default_bucket(&self) -> &str {
        self.default_bucket.as_deref().unwrap_or("")
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| StorageError::InvalidConfig(format!("{} has invalid value '{}'", name, value)))
}

/// Load configuration from a JSON file, then apply env overrides / 加载配置文件并应用环境变量
pub fn load_config(path: &Path) -> Result<StorageConfig> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StorageError::InvalidConfig(format!("failed to read {:?}: {}", path, e))
        })?;
        let config: StorageConfig = serde_json::from_str(&content).map_err(|e| {
            StorageError::InvalidConfig(format!("failed to parse {:?}: {}", path, e))
        })?;
        tracing::info!("Loaded storage configuration from {:?}", path);
        config
    } else {
        tracing::info!("No config file at {:?}, using environment only", path);
        StorageConfig::default()
    };

    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_partial_json() {
        let config: StorageConfig = serde_json::from_str(
            r#"{"service_url":"https://br-se1.magaluobjects.com","access_key_id":"a","secret_access_key":"b"}"#,
        )
        .unwrap();
        assert_eq!(config.provider, "s3");
        assert!(config.use_https);
        assert!(config.force_path_style);
        assert_eq!(config.timeout(), Duration::from_millis(100_000));
        assert_eq!(config.multipart_chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.region(), "us-east-1");
        assert_eq!(config.default_bucket(), "");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_endpoint() {
        let config = StorageConfig::default();
        assert!(matches!(config.validate(), Err(StorageError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = StorageConfig::memory("bucket");
        config.timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_memory_config_is_valid() {
        let config = StorageConfig::memory("assets");
        assert!(config.validate().is_ok());
        assert_eq!(config.default_bucket(), "assets");
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"provider":"memory","default_bucket":"media","region":"br-se1","timeout_ms":5000}"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.provider, "memory");
        assert_eq!(config.default_bucket(), "media");
        assert_eq!(config.region(), "br-se1");
        assert_eq!(config.timeout_ms, 5000);
    }

    #[test]
    fn test_load_config_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_config(&path), Err(StorageError::InvalidConfig(_))));
    }
}
