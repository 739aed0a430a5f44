//! S3驱动核心实现 / S3-compatible backend
//!
//! - 每个请求按存储桶名构建 Bucket 句柄（无共享可变状态）
//! - rust-s3 未启用 fail-on-err，状态码在这里统一检查
//! - 分片上传按 Content-Length 发送，不使用 chunked 编码

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use s3::bucket::Bucket;
use s3::bucket_ops::BucketConfiguration;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::serde_types::Part;
use s3::Region;

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::storage::{CompletedPart, ListPage, ObjectBackend, ObjectHead};
use crate::utils;

/// S3 backend / S3后端
pub struct S3Backend {
    service_url: String,
    region: String,
    use_https: bool,
    force_path_style: bool,
    timeout: Duration,
    credentials: Credentials,
}

/// Map a non-2xx status to a service error / 检查响应状态码
fn check_status(status: u16, body: &[u8]) -> Result<()> {
    if (200..300).contains(&status) {
        return Ok(());
    }
    Err(StorageError::service(status, String::from_utf8_lossy(body).into_owned()))
}

/// HeadBucket status: 2xx present, 404 absent, anything else an error / 存储桶探测状态
fn bucket_status(status: u16) -> Result<bool> {
    match status {
        404 => Ok(false),
        _ => check_status(status, &[]).map(|_| true),
    }
}

/// `Ok(None)` for 404, error for anything else that failed / 404 转为 None
fn not_found_as_none<T>(result: std::result::Result<T, S3Error>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            let err = StorageError::from(e);
            if err.is_not_found() {
                Ok(None)
            } else {
                Err(err)
            }
        }
    }
}

impl S3Backend {
    /// 创建S3后端
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let credentials = Credentials::new(
            Some(&config.access_key_id),
            Some(&config.secret_access_key),
            None,
            None,
            None,
        )
        .map_err(|e| StorageError::InvalidConfig(format!("failed to create S3 credentials: {}", e)))?;

        Ok(Self {
            service_url: config.service_url.clone(),
            region: config.region(),
            use_https: config.use_https,
            force_path_style: config.force_path_style,
            timeout: config.timeout(),
            credentials,
        })
    }

    /// Endpoint for regular requests; an explicit scheme in the URL wins / 普通请求端点
    fn endpoint(&self) -> String {
        let url = self.service_url.trim().trim_end_matches('/');
        if url.contains("://") {
            url.to_string()
        } else {
            utils::endpoint_with_scheme(url, self.use_https)
        }
    }

    fn region_for(&self, endpoint: String) -> Region {
        Region::Custom {
            region: self.region.clone(),
            endpoint,
        }
    }

    /// 创建指定存储桶的客户端句柄
    fn handle_at(&self, bucket: &str, endpoint: String) -> Result<Box<Bucket>> {
        let handle = Bucket::new(bucket, self.region_for(endpoint), self.credentials.clone())?;
        let mut handle = if self.force_path_style {
            handle.with_path_style()
        } else {
            handle
        };
        handle.set_request_timeout(Some(self.timeout));
        Ok(handle)
    }

    fn handle(&self, bucket: &str) -> Result<Box<Bucket>> {
        self.handle_at(bucket, self.endpoint())
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    fn name(&self) -> &str {
        "s3"
    }

    /// HEAD on the bucket root; needs no ListAllMyBuckets permission / 仅探测目标存储桶
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        let handle = self.handle(bucket)?;
        match not_found_as_none(handle.head_object("/").await)? {
            Some((_, code)) => bucket_status(code),
            None => Ok(false),
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let region = self.region_for(self.endpoint());
        let config = BucketConfiguration::default();
        let result = if self.force_path_style {
            Bucket::create_with_path_style(bucket, region, self.credentials.clone(), config).await
        } else {
            Bucket::create(bucket, region, self.credentials.clone(), config).await
        };

        match result {
            // 409: 已被自己创建（并发创建）
            Ok(resp) if resp.success() || resp.response_code == 409 => {
                tracing::info!("S3 bucket ready: {} (status {})", bucket, resp.response_code);
                Ok(())
            }
            Ok(resp) => Err(StorageError::service(resp.response_code, resp.response_text)),
            Err(S3Error::HttpFailWithBody(409, _)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content: Bytes,
        content_type: Option<&str>,
    ) -> Result<()> {
        let handle = self.handle(bucket)?;
        let resp = match content_type.filter(|c| !c.is_empty()) {
            Some(ct) => handle.put_object_with_content_type(key, &content, ct).await?,
            None => handle.put_object(key, &content).await?,
        };
        check_status(resp.status_code(), resp.as_slice())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        let handle = self.handle(bucket)?;
        let Some(resp) = not_found_as_none(handle.get_object(key).await)? else {
            return Ok(None);
        };
        if resp.status_code() == 404 {
            return Ok(None);
        }
        check_status(resp.status_code(), resp.as_slice())?;
        Ok(Some(resp.bytes().clone()))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectHead>> {
        let handle = self.handle(bucket)?;
        let Some((head, code)) = not_found_as_none(handle.head_object(key).await)? else {
            return Ok(None);
        };
        if code == 404 {
            return Ok(None);
        }
        check_status(code, &[])?;
        Ok(Some(ObjectHead {
            size: head.content_length.unwrap_or(0).max(0) as u64,
            content_type: head.content_type,
            etag: head.e_tag,
            last_modified: head.last_modified,
        }))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let handle = self.handle(bucket)?;
        match not_found_as_none(handle.delete_object(key).await)? {
            Some(resp) if resp.status_code() != 404 => check_status(resp.status_code(), resp.as_slice()),
            _ => Ok(()),
        }
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage> {
        let handle = self.handle(bucket)?;
        let (result, code) = handle
            .list_page(
                prefix.to_string(),
                None,
                continuation_token.map(str::to_string),
                None,
                Some(max_keys),
            )
            .await?;
        check_status(code, &[])?;

        Ok(ListPage {
            keys: result.contents.into_iter().map(|obj| obj.key).collect(),
            is_truncated: result.is_truncated,
            next_continuation_token: result.next_continuation_token,
        })
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expiry_secs: u32,
        secure: bool,
    ) -> Result<String> {
        let handle = self.handle_at(bucket, utils::endpoint_with_scheme(&self.service_url, secure))?;
        Ok(handle.presign_get(key, expiry_secs, None).await?)
    }

    async fn initiate_multipart(&self, bucket: &str, key: &str, content_type: &str) -> Result<String> {
        let handle = self.handle(bucket)?;
        let resp = handle.initiate_multipart_upload(key, content_type).await?;
        tracing::debug!("S3分片上传开始: key={}, upload_id={}", key, resp.upload_id);
        Ok(resp.upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        let handle = self.handle(bucket)?;
        let part = handle
            .put_multipart_chunk(data.to_vec(), key, part_number, upload_id, utils::OCTET_STREAM)
            .await?;
        Ok(CompletedPart {
            part_number: part.part_number,
            etag: part.etag,
        })
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        let handle = self.handle(bucket)?;
        let parts: Vec<Part> = parts
            .into_iter()
            .map(|p| Part {
                part_number: p.part_number,
                etag: p.etag,
            })
            .collect();
        let resp = handle.complete_multipart_upload(key, upload_id, parts).await?;
        check_status(resp.status_code(), resp.as_slice())?;

        // CompleteMultipartUpload 可能返回 200 但正文为错误
        let body = String::from_utf8_lossy(resp.as_slice());
        if body.contains("<Error>") {
            return Err(StorageError::service(resp.status_code(), body.into_owned()));
        }
        Ok(())
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        let handle = self.handle(bucket)?;
        handle.abort_upload(key, upload_id).await?;
        Ok(())
    }
}
