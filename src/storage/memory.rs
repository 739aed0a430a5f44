//! In-process S3 emulation / 内存对象存储后端
//!
//! Behaves like an S3-compatible service for buckets, objects, listing,
//! multipart sessions and presigned GET URLs. Test builds add fault injection
//! so failure paths can be exercised without a network.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::{CompletedPart, ListPage, ObjectBackend, ObjectHead};
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::utils;

type HmacSha256 = Hmac<Sha256>;

const DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

struct StoredObject {
    data: Bytes,
    content_type: Option<String>,
    etag: String,
    last_modified: DateTime<Utc>,
    /// Part numbers the object was assembled from / 组成对象的分片序号
    #[cfg_attr(not(test), allow(dead_code))]
    parts: Vec<u32>,
}

struct PendingUpload {
    bucket: String,
    key: String,
    content_type: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct State {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    uploads: HashMap<String, PendingUpload>,
}

#[derive(Default)]
struct Faults {
    fail_part: Option<u32>,
    fail_head: bool,
    fail_bucket_create: bool,
    fail_delete: bool,
    latency: Option<Duration>,
}

/// Memory backend / 内存后端
pub struct MemoryBackend {
    service_url: String,
    secret: String,
    state: Mutex<State>,
    faults: Mutex<Faults>,
    requests: AtomicUsize,
    puts: AtomicUsize,
    lists: AtomicUsize,
}

fn etag_of(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!("\"{}\"", &hex::encode(digest)[..32])
}

fn injected(message: &str) -> StorageError {
    StorageError::service(500, format!("InternalError: {}", message))
}

fn no_such_bucket(bucket: &str) -> StorageError {
    StorageError::service(404, format!("NoSuchBucket: {}", bucket))
}

fn no_such_upload(upload_id: &str) -> StorageError {
    StorageError::service(404, format!("NoSuchUpload: {}", upload_id))
}

impl MemoryBackend {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            service_url: config.service_url.clone(),
            secret: config.secret_access_key.clone(),
            state: Mutex::new(State::default()),
            faults: Mutex::new(Faults::default()),
            requests: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
        }
    }

    #[cfg(test)]
    /// Fail uploads of the given part number / 指定分片上传失败
    pub fn fail_part_upload(&self, part_number: Option<u32>) {
        self.faults.lock().fail_part = part_number;
    }

    #[cfg(test)]
    pub fn fail_head_requests(&self, fail: bool) {
        self.faults.lock().fail_head = fail;
    }

    #[cfg(test)]
    pub fn fail_bucket_creation(&self, fail: bool) {
        self.faults.lock().fail_bucket_create = fail;
    }

    #[cfg(test)]
    pub fn fail_deletes(&self, fail: bool) {
        self.faults.lock().fail_delete = fail;
    }

    #[cfg(test)]
    /// Delay every request / 为每个请求添加延迟
    pub fn set_latency(&self, latency: Duration) {
        self.faults.lock().latency = Some(latency);
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.state.lock().buckets.contains_key(bucket)
    }

    /// Total requests served / 已处理请求数
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn list_request_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    /// Multipart sessions neither completed nor aborted / 未完成的分片会话数
    pub fn pending_upload_count(&self) -> usize {
        self.state.lock().uploads.len()
    }

    #[cfg(test)]
    pub fn completed_part_numbers(&self, bucket: &str, key: &str) -> Vec<u32> {
        self.state
            .lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|obj| obj.parts.clone())
            .unwrap_or_default()
    }

    async fn begin(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let latency = self.faults.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn sign(&self, bucket: &str, key: &str, date: &str, expires: u32) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| StorageError::Transport(format!("invalid signing key: {}", e)))?;
        mac.update(format!("GET\n/{}/{}\n{}\n{}", bucket, key, date, expires).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check a presigned URL as the service would at `now` / 校验预签名URL
    ///
    /// Returns the addressed (bucket, key) when the signature matches and the
    /// validity window has not elapsed.
    pub fn verify_presigned(&self, presigned: &str, now: DateTime<Utc>) -> Result<(String, String)> {
        let parsed = url::Url::parse(presigned)
            .map_err(|e| StorageError::Transport(format!("malformed url: {}", e)))?;

        let mut segments = parsed
            .path_segments()
            .ok_or_else(|| StorageError::service(400, "missing path"))?;
        let bucket = segments
            .next()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| StorageError::service(400, "missing bucket"))?
            .to_string();
        let key = segments
            .map(|s| urlencoding::decode(s).map(|c| c.into_owned()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| StorageError::service(400, format!("bad key encoding: {}", e)))?
            .join("/");

        let query: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
        let param = |name: &str| {
            query
                .get(name)
                .cloned()
                .ok_or_else(|| StorageError::service(403, format!("missing {}", name)))
        };
        let date = param("X-Amz-Date")?;
        let expires: u32 = param("X-Amz-Expires")?
            .parse()
            .map_err(|_| StorageError::service(403, "bad X-Amz-Expires"))?;
        let signature = param("X-Amz-Signature")?;

        if self.sign(&bucket, &key, &date, expires)? != signature {
            return Err(StorageError::service(403, "SignatureDoesNotMatch"));
        }

        let signed_at = NaiveDateTime::parse_from_str(&date, DATE_FORMAT)
            .map_err(|_| StorageError::service(403, "bad X-Amz-Date"))?
            .and_utc();
        if now > signed_at + chrono::Duration::seconds(expires as i64) {
            return Err(StorageError::service(403, "AccessDenied: Request has expired"));
        }
        Ok((bucket, key))
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        self.begin().await;
        Ok(self.state.lock().buckets.contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.begin().await;
        if self.faults.lock().fail_bucket_create {
            return Err(injected("bucket creation"));
        }
        self.state.lock().buckets.entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content: Bytes,
        content_type: Option<&str>,
    ) -> Result<()> {
        self.begin().await;
        self.puts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let objects = state.buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                etag: etag_of(&content),
                data: content,
                content_type: content_type.filter(|c| !c.is_empty()).map(str::to_string),
                last_modified: Utc::now(),
                parts: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        self.begin().await;
        let state = self.state.lock();
        Ok(state
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|obj| obj.data.clone()))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectHead>> {
        self.begin().await;
        if self.faults.lock().fail_head {
            return Err(injected("head"));
        }
        let state = self.state.lock();
        Ok(state
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|obj| ObjectHead {
                size: obj.data.len() as u64,
                content_type: Some(
                    obj.content_type
                        .clone()
                        .unwrap_or_else(|| utils::OCTET_STREAM.to_string()),
                ),
                etag: Some(obj.etag.clone()),
                last_modified: Some(obj.last_modified.to_rfc2822()),
            }))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.begin().await;
        if self.faults.lock().fail_delete {
            return Err(injected("delete"));
        }
        if let Some(objects) = self.state.lock().buckets.get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage> {
        self.begin().await;
        self.lists.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let objects = state.buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;

        // Token is the last key of the previous page / 续传令牌为上一页最后一个键
        let mut matching = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| continuation_token.map_or(true, |t| k.as_str() > t));

        let keys: Vec<String> = matching.by_ref().take(max_keys.max(1)).cloned().collect();
        let is_truncated = matching.next().is_some();
        Ok(ListPage {
            next_continuation_token: if is_truncated { keys.last().cloned() } else { None },
            keys,
            is_truncated,
        })
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expiry_secs: u32,
        secure: bool,
    ) -> Result<String> {
        self.begin().await;
        let date = Utc::now().format(DATE_FORMAT).to_string();
        let signature = self.sign(bucket, key, &date, expiry_secs)?;
        let encoded_key = key
            .split('/')
            .map(|s| urlencoding::encode(s).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!(
            "{}/{}/{}?X-Amz-Date={}&X-Amz-Expires={}&X-Amz-Signature={}",
            utils::endpoint_with_scheme(&self.service_url, secure),
            bucket,
            encoded_key,
            date,
            expiry_secs,
            signature
        ))
    }

    async fn initiate_multipart(&self, bucket: &str, key: &str, content_type: &str) -> Result<String> {
        self.begin().await;
        let mut state = self.state.lock();
        if !state.buckets.contains_key(bucket) {
            return Err(no_such_bucket(bucket));
        }
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                content_type: content_type.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        self.begin().await;
        if self.faults.lock().fail_part == Some(part_number) {
            return Err(injected("part upload"));
        }
        let mut state = self.state.lock();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| no_such_upload(upload_id))?;
        let etag = etag_of(&data);
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        self.begin().await;
        let mut state = self.state.lock();
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| no_such_upload(upload_id))?;

        if parts.is_empty() || parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(StorageError::service(400, "InvalidPartOrder"));
        }

        let mut data = BytesMut::new();
        for part in &parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, chunk)) if *etag == part.etag => data.extend_from_slice(chunk),
                _ => return Err(StorageError::service(400, format!("InvalidPart: {}", part.part_number))),
            }
        }

        let content_type = upload.content_type.clone();
        let data = data.freeze();
        let object = StoredObject {
            etag: format!("\"{}-{}\"", etag_of(&data).trim_matches('"'), parts.len()),
            data,
            content_type: Some(content_type),
            last_modified: Utc::now(),
            parts: parts.iter().map(|p| p.part_number).collect(),
        };

        state.uploads.remove(upload_id);
        state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket(bucket))?
            .insert(key.to_string(), object);
        Ok(())
    }

    async fn abort_multipart(&self, _bucket: &str, _key: &str, upload_id: &str) -> Result<()> {
        self.begin().await;
        self.state
            .lock()
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| no_such_upload(upload_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MemoryBackend {
        MemoryBackend::new(&StorageConfig::memory("b"))
    }

    #[tokio::test]
    async fn test_put_requires_bucket() {
        let backend = backend();
        let err = backend
            .put_object("missing", "k", Bytes::from_static(b"x"), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_page_tokens() {
        let backend = backend();
        backend.create_bucket("b").await.unwrap();
        for key in ["a/1", "a/2", "a/3", "b/1"] {
            backend.put_object("b", key, Bytes::new(), None).await.unwrap();
        }

        let first = backend.list_page("b", "a/", None, 2).await.unwrap();
        assert_eq!(first.keys, vec!["a/1", "a/2"]);
        assert!(first.is_truncated);

        let second = backend
            .list_page("b", "a/", first.next_continuation_token.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(second.keys, vec!["a/3"]);
        assert!(!second.is_truncated);
        assert!(second.next_continuation_token.is_none());
    }

    #[tokio::test]
    async fn test_presigned_rejects_tampering() {
        let backend = backend();
        let url = backend.presign_get("b", "dir/file name.txt", 60, false).await.unwrap();
        assert!(url.starts_with("http://localhost:9000/b/dir/file%20name.txt?"));

        let (bucket, key) = backend.verify_presigned(&url, Utc::now()).unwrap();
        assert_eq!((bucket.as_str(), key.as_str()), ("b", "dir/file name.txt"));

        let tampered = url.replace("X-Amz-Expires=60", "X-Amz-Expires=6000");
        let err = backend.verify_presigned(&tampered, Utc::now()).unwrap_err();
        assert!(matches!(err, StorageError::Service { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_complete_rejects_wrong_etag() {
        let backend = backend();
        backend.create_bucket("b").await.unwrap();
        let id = backend.initiate_multipart("b", "k", "application/octet-stream").await.unwrap();
        backend.upload_part("b", "k", &id, 1, Bytes::from_static(b"x")).await.unwrap();
        let err = backend
            .complete_multipart(
                "b",
                "k",
                &id,
                vec![CompletedPart {
                    part_number: 1,
                    etag: "\"bogus\"".into(),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Service { status: 400, .. }));
    }
}
