//! Object-storage gateway / 对象存储网关
//!
//! Every operation resolves the bucket first, writes additionally make sure
//! the bucket exists, and service "not found" answers become `None`/`false`.
//! 所有操作先解析存储桶，写操作额外确保存储桶存在

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{BackendRef, ObjectHead};
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::utils;

/// Default listing page size / 默认分页大小
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Storage gateway bound to one configuration / 存储网关
///
/// Cheap to clone; clones share the backend handle and cancellation token.
#[derive(Clone)]
pub struct BlobStorage {
    config: Arc<StorageConfig>,
    backend: BackendRef,
    cancel: CancellationToken,
}

impl BlobStorage {
    /// Validate config and build the configured backend / 校验配置并创建后端
    pub fn new(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let backend = crate::drivers::create_backend(&config)?;
        Ok(Self::with_backend(config, backend))
    }

    /// Use an explicit backend instance / 使用指定后端
    pub fn with_backend(config: StorageConfig, backend: BackendRef) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            cancel: CancellationToken::new(),
        }
    }

    /// Remote calls fail with `Cancelled` once `token` fires / 绑定取消令牌
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn backend(&self) -> &BackendRef {
        &self.backend
    }

    /// Resolve the effective bucket name / 解析存储桶
    pub fn resolve_bucket(&self, container: Option<&str>) -> String {
        utils::resolve_bucket(container, self.config.default_bucket())
    }

    fn require_bucket(&self, container: Option<&str>) -> Result<String> {
        let bucket = self.resolve_bucket(container);
        if bucket.trim().is_empty() {
            return Err(StorageError::EmptyBucket);
        }
        Ok(bucket)
    }

    /// Reject an empty key before it addresses the bucket itself / 拒绝空对象键
    pub(crate) fn require_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        Ok(())
    }

    /// Run one remote call under the request timeout and cancellation token / 带超时和取消的远程调用
    pub(crate) async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.config.timeout();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StorageError::Cancelled),
            res = tokio::time::timeout(timeout, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(StorageError::Timeout(timeout)),
            },
        }
    }

    /// Make sure the bucket exists, creating it on first use / 确保存储桶存在
    ///
    /// Never fails: any error is logged and reported as `false`.
    pub async fn ensure_bucket_exists(&self, bucket: &str) -> bool {
        if bucket.trim().is_empty() {
            return false;
        }

        let result = async {
            if !self.call(self.backend.bucket_exists(bucket)).await? {
                tracing::info!("Bucket {} not found, creating", bucket);
                self.call(self.backend.create_bucket(bucket)).await?;
            }
            Ok::<(), StorageError>(())
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Error ensuring bucket exists: bucket={}, error={}", bucket, e);
                false
            }
        }
    }

    pub(crate) async fn ensure_bucket_or_fail(&self, bucket: &str) -> Result<()> {
        if self.ensure_bucket_exists(bucket).await {
            Ok(())
        } else {
            tracing::error!("Bucket does not exist and could not be created: {}", bucket);
            Err(StorageError::BucketUnavailable(bucket.to_string()))
        }
    }

    /// Upload raw bytes / 上传字节
    ///
    /// With `overwrite == false` an existing object is left untouched and the
    /// call still succeeds. The check and the write are not atomic.
    pub async fn upload(
        &self,
        container: Option<&str>,
        key: &str,
        content: impl Into<Bytes>,
        content_type: Option<&str>,
        overwrite: bool,
    ) -> Result<()> {
        if key.is_empty() {
            tracing::warn!("Upload skipped because the object key is empty");
            return Ok(());
        }
        let bucket = self.resolve_bucket(container);
        self.ensure_bucket_or_fail(&bucket).await?;

        if !overwrite && self.exists_in(&bucket, key).await {
            tracing::warn!(
                "Upload skipped because target exists and overwrite=false: bucket={}, key={}",
                bucket,
                key
            );
            return Ok(());
        }

        let content = content.into();
        let size = content.len();
        self.call(self.backend.put_object(&bucket, key, content, content_type))
            .await
            .map_err(|e| {
                tracing::error!("Upload failed: bucket={}, key={}, error={}", bucket, key, e);
                e
            })?;

        tracing::debug!("Uploaded object: bucket={}, key={}, size={}", bucket, key, size);
        Ok(())
    }

    /// Decode base64 content then upload / 解码 base64 后上传
    pub async fn upload_base64(
        &self,
        container: Option<&str>,
        key: &str,
        base64_content: &str,
        content_type: Option<&str>,
        overwrite: bool,
    ) -> Result<()> {
        let content = base64::engine::general_purpose::STANDARD.decode(base64_content.trim())?;
        self.upload(container, key, content, content_type, overwrite).await
    }

    /// Read a local file and upload it, inferring the content type / 从本地文件上传
    pub async fn upload_from_file_path(
        &self,
        container: Option<&str>,
        key: &str,
        source_file_path: impl AsRef<Path>,
        overwrite: bool,
    ) -> Result<()> {
        let path = source_file_path.as_ref();
        let content = tokio::fs::read(path)
            .await
            .map_err(|source| StorageError::SourceFileUnreadable {
                path: path.to_path_buf(),
                source,
            })?;
        let content_type = utils::content_type_for_path(&path.to_string_lossy());
        self.upload(container, key, content, Some(content_type), overwrite).await
    }

    /// Download the whole object; `None` if it does not exist / 下载对象
    pub async fn download(&self, container: Option<&str>, key: &str) -> Result<Option<Bytes>> {
        let bucket = self.require_bucket(container)?;
        if key.is_empty() {
            return Ok(None);
        }
        let data = self.call(self.backend.get_object(&bucket, key)).await?;
        if data.is_none() {
            tracing::debug!("Object not found: bucket={}, key={}", bucket, key);
        }
        Ok(data)
    }

    /// Presigned URL when `expiry_secs > 0`, otherwise a direct path-style URL / 获取访问URL
    ///
    /// Direct URLs are built without any request and may point to a private
    /// or missing object.
    pub async fn get_url(
        &self,
        container: Option<&str>,
        key: &str,
        secure: bool,
        expiry_secs: u32,
    ) -> Result<String> {
        let bucket = self.require_bucket(container)?;
        Self::require_key(key)?;
        if expiry_secs > 0 {
            return self
                .call(self.backend.presign_get(&bucket, key, expiry_secs, secure))
                .await;
        }
        Ok(utils::direct_url(&self.config.service_url, &bucket, key, secure))
    }

    /// Whether the object exists; probe failures are logged and read as `false` / 检查对象是否存在
    pub async fn exists(&self, container: Option<&str>, key: &str) -> bool {
        let bucket = self.resolve_bucket(container);
        self.exists_in(&bucket, key).await
    }

    async fn exists_in(&self, bucket: &str, key: &str) -> bool {
        match self.probe_in(bucket, key).await {
            Ok(found) => found,
            Err(e) => {
                tracing::error!("Error checking existence: bucket={}, key={}, error={}", bucket, key, e);
                false
            }
        }
    }

    /// Existence check that keeps "probe failed" apart from "absent" / 区分失败与不存在的检查
    pub async fn probe(&self, container: Option<&str>, key: &str) -> Result<bool> {
        let bucket = self.resolve_bucket(container);
        self.probe_in(&bucket, key).await
    }

    async fn probe_in(&self, bucket: &str, key: &str) -> Result<bool> {
        if bucket.trim().is_empty() {
            return Err(StorageError::EmptyBucket);
        }
        if key.is_empty() {
            return Ok(false);
        }
        Ok(self.call(self.backend.head_object(bucket, key)).await?.is_some())
    }

    /// Object metadata, `None` if missing / 获取对象元数据
    pub async fn head(&self, container: Option<&str>, key: &str) -> Result<Option<ObjectHead>> {
        let bucket = self.require_bucket(container)?;
        if key.is_empty() {
            return Ok(None);
        }
        self.call(self.backend.head_object(&bucket, key)).await
    }

    /// Delete an object; deleting a missing object succeeds / 删除对象
    pub async fn delete(&self, container: Option<&str>, key: &str) -> Result<()> {
        let bucket = self.require_bucket(container)?;
        if key.is_empty() {
            tracing::warn!("Delete skipped because the object key is empty: bucket={}", bucket);
            return Ok(());
        }
        self.call(self.backend.delete_object(&bucket, key))
            .await
            .map_err(|e| {
                tracing::error!("Failed to delete object: bucket={}, key={}, error={}", bucket, key, e);
                e
            })
    }

    /// List every key under `prefix`, following continuation tokens / 分页列出所有键
    pub async fn list_files(
        &self,
        container: Option<&str>,
        prefix: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<Vec<String>> {
        let bucket = self.require_bucket(container)?;
        let prefix = prefix.unwrap_or("");
        let page_size = max_results.filter(|n| *n > 0).unwrap_or(DEFAULT_PAGE_SIZE);

        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self
                .call(self.backend.list_page(&bucket, prefix, token.as_deref(), page_size))
                .await?;
            pages += 1;
            keys.extend(page.keys);

            if !page.is_truncated {
                break;
            }
            match page.next_continuation_token {
                Some(next) => token = Some(next),
                None => {
                    tracing::warn!(
                        "Listing truncated without continuation token: bucket={}, prefix={}",
                        bucket,
                        prefix
                    );
                    break;
                }
            }
        }

        tracing::debug!(
            "Listed objects: bucket={}, prefix={}, keys={}, pages={}",
            bucket,
            prefix,
            keys.len(),
            pages
        );
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use std::time::Duration;

    fn gateway() -> (BlobStorage, Arc<MemoryBackend>) {
        let config = StorageConfig::memory("default-bucket");
        let backend = Arc::new(MemoryBackend::new(&config));
        (BlobStorage::with_backend(config, backend.clone()), backend)
    }

    #[test]
    fn test_resolve_bucket_uses_default() {
        let (storage, _) = gateway();
        assert_eq!(storage.resolve_bucket(None), "default-bucket");
        assert_eq!(storage.resolve_bucket(Some(" ")), "default-bucket");
        assert_eq!(storage.resolve_bucket(Some("other")), "other");
    }

    #[tokio::test]
    async fn test_ensure_bucket_creates_once() {
        let (storage, backend) = gateway();
        assert!(!backend.has_bucket("fresh"));
        assert!(storage.ensure_bucket_exists("fresh").await);
        assert!(backend.has_bucket("fresh"));
        assert!(storage.ensure_bucket_exists("fresh").await);
    }

    #[tokio::test]
    async fn test_ensure_bucket_empty_name() {
        let (storage, backend) = gateway();
        assert!(!storage.ensure_bucket_exists("").await);
        assert_eq!(backend.request_count(), 0);
    }

    #[tokio::test]
    async fn test_ensure_bucket_swallows_failure() {
        let (storage, backend) = gateway();
        backend.fail_bucket_creation(true);
        assert!(!storage.ensure_bucket_exists("broken").await);
    }

    #[tokio::test]
    async fn test_upload_fails_when_bucket_unavailable() {
        let (storage, backend) = gateway();
        backend.fail_bucket_creation(true);
        let err = storage
            .upload(Some("broken"), "a.txt", b"x".to_vec(), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::BucketUnavailable(ref b) if b == "broken"));
    }

    #[tokio::test]
    async fn test_upload_without_any_bucket() {
        let config = StorageConfig {
            default_bucket: None,
            ..StorageConfig::memory("")
        };
        let backend = Arc::new(MemoryBackend::new(&config));
        let storage = BlobStorage::with_backend(config, backend.clone());
        let err = storage.upload(None, "a.txt", b"x".to_vec(), None, false).await.unwrap_err();
        assert!(matches!(err, StorageError::BucketUnavailable(_)));
        assert_eq!(backend.request_count(), 0);
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let (storage, _) = gateway();
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        storage.upload(None, "bin/blob", payload.clone(), None, false).await.unwrap();
        let data = storage.download(None, "bin/blob").await.unwrap().unwrap();
        assert_eq!(data.as_ref(), payload.as_slice());

        storage.upload(None, "empty", Vec::new(), None, false).await.unwrap();
        let data = storage.download(None, "empty").await.unwrap().unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_upload_without_overwrite_keeps_content() {
        let (storage, backend) = gateway();
        storage.upload(None, "doc.txt", b"first".to_vec(), Some("text/plain"), false).await.unwrap();
        let puts = backend.put_count();

        storage.upload(None, "doc.txt", b"second".to_vec(), Some("text/plain"), false).await.unwrap();
        assert_eq!(backend.put_count(), puts);
        let data = storage.download(None, "doc.txt").await.unwrap().unwrap();
        assert_eq!(data.as_ref(), b"first");
    }

    #[tokio::test]
    async fn test_upload_with_overwrite_replaces_content() {
        let (storage, _) = gateway();
        storage.upload(None, "doc.txt", b"first".to_vec(), None, true).await.unwrap();
        storage.upload(None, "doc.txt", b"second".to_vec(), None, true).await.unwrap();
        let data = storage.download(None, "doc.txt").await.unwrap().unwrap();
        assert_eq!(data.as_ref(), b"second");
    }

    #[tokio::test]
    async fn test_upload_base64() {
        let (storage, _) = gateway();
        storage.upload_base64(None, "hello.txt", "aGVsbG8=", Some("text/plain"), false).await.unwrap();
        let data = storage.download(None, "hello.txt").await.unwrap().unwrap();
        assert_eq!(data.as_ref(), b"hello");
        let head = storage.head(None, "hello.txt").await.unwrap().unwrap();
        assert_eq!(head.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_upload_base64_rejects_garbage() {
        let (storage, backend) = gateway();
        let err = storage.upload_base64(None, "x", "@@not base64@@", None, false).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidEncoding(_)));
        assert_eq!(backend.put_count(), 0);
    }

    #[tokio::test]
    async fn test_upload_from_file_path_infers_content_type() {
        let (storage, _) = gateway();
        let dir = tempfile::tempdir().unwrap();

        let png = dir.path().join("logo.png");
        std::fs::write(&png, [0x89, b'P', b'N', b'G']).unwrap();
        storage.upload_from_file_path(None, "img/logo.png", &png, false).await.unwrap();
        let head = storage.head(None, "img/logo.png").await.unwrap().unwrap();
        assert_eq!(head.content_type.as_deref(), Some("image/png"));
        assert_eq!(head.size, 4);

        let unknown = dir.path().join("data.xyz");
        std::fs::write(&unknown, b"??").unwrap();
        storage.upload_from_file_path(None, "data.xyz", &unknown, false).await.unwrap();
        let head = storage.head(None, "data.xyz").await.unwrap().unwrap();
        assert_eq!(head.content_type.as_deref(), Some("application/octet-stream"));
    }

    #[tokio::test]
    async fn test_upload_from_missing_file() {
        let (storage, _) = gateway();
        let err = storage
            .upload_from_file_path(None, "k", "/definitely/not/here.txt", false)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SourceFileUnreadable { .. }));
    }

    #[tokio::test]
    async fn test_download_missing_is_none() {
        let (storage, _) = gateway();
        assert!(storage.download(None, "nope").await.unwrap().is_none());
        assert!(storage.download(Some("no-such-bucket"), "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exists_after_upload() {
        let (storage, _) = gateway();
        assert!(!storage.exists(None, "a/b.txt").await);
        storage.upload(None, "a/b.txt", b"x".to_vec(), None, false).await.unwrap();
        assert!(storage.exists(None, "a/b.txt").await);
    }

    #[tokio::test]
    async fn test_exists_swallows_probe_failure() {
        let (storage, backend) = gateway();
        storage.upload(None, "k", b"x".to_vec(), None, false).await.unwrap();
        backend.fail_head_requests(true);
        assert!(!storage.exists(None, "k").await);
        assert!(storage.probe(None, "k").await.is_err());
        backend.fail_head_requests(false);
        assert!(storage.probe(None, "k").await.unwrap());
        assert!(!storage.probe(None, "missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (storage, _) = gateway();
        storage.upload(None, "tmp", b"x".to_vec(), None, false).await.unwrap();
        storage.delete(None, "tmp").await.unwrap();
        assert!(!storage.exists(None, "tmp").await);
        storage.delete(None, "tmp").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_propagates_failure() {
        let (storage, backend) = gateway();
        backend.fail_deletes(true);
        let err = storage.delete(None, "tmp").await.unwrap_err();
        assert!(matches!(err, StorageError::Service { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_list_files_paginates() {
        let (storage, backend) = gateway();
        for i in 0..7 {
            storage.upload(None, &format!("logs/{:02}.txt", i), b"x".to_vec(), None, false).await.unwrap();
        }
        storage.upload(None, "other/x.txt", b"x".to_vec(), None, false).await.unwrap();

        let before = backend.list_request_count();
        let keys = storage.list_files(None, Some("logs/"), Some(3)).await.unwrap();
        assert_eq!(backend.list_request_count() - before, 3);
        let expected: Vec<String> = (0..7).map(|i| format!("logs/{:02}.txt", i)).collect();
        assert_eq!(keys, expected);

        let all = storage.list_files(None, None, None).await.unwrap();
        assert_eq!(all.len(), 8);
    }

    #[tokio::test]
    async fn test_list_files_empty_prefix_match() {
        let (storage, _) = gateway();
        storage.upload(None, "a.txt", b"x".to_vec(), None, false).await.unwrap();
        let keys = storage.list_files(None, Some("nothing/"), Some(2)).await.unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn test_get_url_direct() {
        let (storage, backend) = gateway();
        let url = storage.get_url(None, "a/b.png", true, 0).await.unwrap();
        assert_eq!(url, "https://localhost:9000/default-bucket/a/b.png");
        let url = storage.get_url(Some("media"), "b.png", false, 0).await.unwrap();
        assert_eq!(url, "http://localhost:9000/media/b.png");
        assert_eq!(backend.request_count(), 0);
    }

    #[tokio::test]
    async fn test_get_url_presigned_expires() {
        let (storage, backend) = gateway();
        storage.upload(None, "secret.pdf", b"%PDF".to_vec(), None, false).await.unwrap();
        let url = storage.get_url(None, "secret.pdf", true, 60).await.unwrap();
        assert!(url.starts_with("https://"));

        let now = chrono::Utc::now();
        let (bucket, key) = backend.verify_presigned(&url, now).unwrap();
        assert_eq!(bucket, "default-bucket");
        assert_eq!(key, "secret.pdf");
        assert!(backend.verify_presigned(&url, now + chrono::Duration::seconds(61)).is_err());
    }

    #[tokio::test]
    async fn test_empty_key_never_reaches_backend() {
        let (storage, backend) = gateway();
        storage.upload(None, "real.txt", b"x".to_vec(), None, false).await.unwrap();
        let before = backend.request_count();

        storage.upload(None, "", b"x".to_vec(), None, true).await.unwrap();
        storage.upload_base64(None, "", "aGVsbG8=", None, true).await.unwrap();
        assert!(storage.download(None, "").await.unwrap().is_none());
        assert!(storage.head(None, "").await.unwrap().is_none());
        assert!(!storage.exists(None, "").await);
        assert!(!storage.probe(None, "").await.unwrap());
        storage.delete(None, "").await.unwrap();
        assert!(matches!(storage.get_url(None, "", true, 0).await, Err(StorageError::EmptyKey)));
        assert!(matches!(storage.get_url(None, "", true, 60).await, Err(StorageError::EmptyKey)));

        assert_eq!(backend.request_count(), before);
        assert_eq!(storage.list_files(None, None, None).await.unwrap(), vec!["real.txt"]);
    }

    #[tokio::test]
    async fn test_timeout_bounds_requests() {
        let mut config = StorageConfig::memory("b");
        config.timeout_ms = 20;
        let backend = Arc::new(MemoryBackend::new(&config));
        backend.set_latency(Duration::from_millis(200));
        let storage = BlobStorage::with_backend(config, backend);
        let err = storage.download(None, "k").await.unwrap_err();
        assert!(matches!(err, StorageError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let config = StorageConfig::memory("b");
        let backend = Arc::new(MemoryBackend::new(&config));
        let token = CancellationToken::new();
        let storage = BlobStorage::with_backend(config, backend).with_cancellation(token.clone());
        token.cancel();
        let err = storage.list_files(None, None, None).await.unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
    }
}
