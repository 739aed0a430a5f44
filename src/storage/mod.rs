use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;

pub mod gateway;
pub mod memory;
pub mod multipart;

pub use gateway::BlobStorage;
pub use memory::MemoryBackend;
pub use multipart::{MultipartSession, MultipartState, MultipartSummary};

/// Shared backend handle / 共享后端句柄
pub type BackendRef = Arc<dyn ObjectBackend>;

/// Object metadata from a HEAD request / 对象元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHead {
    pub size: u64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// One page of a ListObjectsV2 response / 列表分页结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Keys in service order / 服务端返回顺序的键
    pub keys: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

/// Uploaded part identifier / 已上传分片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// 1-based part number / 分片序号（从1开始）
    pub part_number: u32,
    pub etag: String,
}

/// Object storage service interface (primitive operations only) / 对象存储服务接口
///
/// Implementations report a missing object as `None`, never as an error.
/// Every other failure is returned as `StorageError`.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Backend name / 后端名称
    fn name(&self) -> &str;

    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Create bucket; creating an already-owned bucket succeeds / 创建存储桶
    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// Single-shot PUT / 单次上传
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content: Bytes,
        content_type: Option<&str>,
    ) -> Result<()>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Bytes>>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectHead>>;

    /// Delete; a missing object is a success / 删除对象，不存在视为成功
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage>;

    /// Presigned GET valid for `expiry_secs` from now / 生成预签名下载URL
    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expiry_secs: u32,
        secure: bool,
    ) -> Result<String>;

    /// Start a multipart session, returns the upload id / 初始化分片上传
    async fn initiate_multipart(&self, bucket: &str, key: &str, content_type: &str)
        -> Result<String>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart>;

    /// `parts` must be sorted by part number / 分片须按序号排序
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()>;

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;
}
