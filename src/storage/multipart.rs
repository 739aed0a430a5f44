//! Multipart upload protocol / 分片上传协议
//!
//! Sessions move Initiated -> PartsUploaded, and are consumed by
//! `complete_multipart` or `abort_multipart`, so a finished session cannot be reused.
//! Parts go up with bounded concurrency. Completion sorts them and rejects gaps.

use std::collections::BTreeMap;
use std::path::Path;

use bytes::{Bytes, BytesMut};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::gateway::BlobStorage;
use super::CompletedPart;
use crate::error::{Result, StorageError};
use crate::utils;

/// S3 part number upper bound / S3 分片数量上限
pub const MAX_PARTS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipartState {
    Initiated,
    PartsUploaded,
}

/// In-progress multipart upload / 进行中的分片上传
#[derive(Debug)]
pub struct MultipartSession {
    bucket: String,
    key: String,
    upload_id: String,
    parts: BTreeMap<u32, String>,
}

impl MultipartSession {
    pub(crate) fn new(bucket: String, key: String, upload_id: String) -> Self {
        Self {
            bucket,
            key,
            upload_id,
            parts: BTreeMap::new(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn state(&self) -> MultipartState {
        if self.parts.is_empty() {
            MultipartState::Initiated
        } else {
            MultipartState::PartsUploaded
        }
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Record an uploaded part; re-uploading a number replaces its etag / 记录分片
    pub fn record_part(&mut self, part: CompletedPart) -> Result<()> {
        check_part_number(part.part_number)?;
        self.parts.insert(part.part_number, part.etag);
        Ok(())
    }

    /// Parts sorted by number, rejecting an empty or gapped list / 按序号排列的分片列表
    pub fn ordered_parts(&self) -> Result<Vec<CompletedPart>> {
        if self.parts.is_empty() {
            return Err(StorageError::MultipartState(format!(
                "no parts uploaded for {}/{}",
                self.bucket, self.key
            )));
        }
        for (expected, number) in (1u32..).zip(self.parts.keys()) {
            if *number != expected {
                return Err(StorageError::MultipartState(format!(
                    "part list has a gap: expected part {}, found {}",
                    expected, number
                )));
            }
        }
        Ok(self
            .parts
            .iter()
            .map(|(number, etag)| CompletedPart {
                part_number: *number,
                etag: etag.clone(),
            })
            .collect())
    }
}

fn check_part_number(part_number: u32) -> Result<()> {
    if part_number == 0 || part_number > MAX_PARTS {
        return Err(StorageError::MultipartState(format!(
            "part number {} outside 1..={}",
            part_number, MAX_PARTS
        )));
    }
    Ok(())
}

/// Outcome of a driven multipart upload / 分片上传结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartSummary {
    pub parts: u32,
    pub bytes: u64,
    /// Target existed and overwrite was off / 目标已存在且未允许覆盖
    pub skipped: bool,
}

/// Fill one chunk from the reader; shorter than `size` only at EOF / 读取一个分片
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, size: usize) -> std::io::Result<Bytes> {
    let mut buf = BytesMut::with_capacity(size);
    while buf.len() < size {
        let n = (&mut *reader).take((size - buf.len()) as u64).read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
    }
    Ok(buf.freeze())
}

impl BlobStorage {
    /// Open a multipart session, provisioning the bucket / 初始化分片上传
    pub async fn initiate_multipart(
        &self,
        container: Option<&str>,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<MultipartSession> {
        Self::require_key(key)?;
        let bucket = self.resolve_bucket(container);
        self.ensure_bucket_or_fail(&bucket).await?;

        let content_type = content_type.unwrap_or(utils::OCTET_STREAM);
        let upload_id = self
            .call(self.backend().initiate_multipart(&bucket, key, content_type))
            .await?;

        tracing::debug!("Multipart upload started: bucket={}, key={}, upload_id={}", bucket, key, upload_id);
        Ok(MultipartSession::new(bucket, key.to_string(), upload_id))
    }

    /// Upload one part; the caller records the result / 上传单个分片
    ///
    /// Takes the session by shared reference so parts can be sent concurrently.
    pub async fn upload_part(
        &self,
        session: &MultipartSession,
        part_number: u32,
        data: Bytes,
    ) -> Result<CompletedPart> {
        check_part_number(part_number)?;
        let size = data.len();
        let part = self
            .call(self.backend().upload_part(
                &session.bucket,
                &session.key,
                &session.upload_id,
                part_number,
                data,
            ))
            .await
            .map_err(|e| {
                tracing::error!(
                    "Part upload failed: key={}, part={}, error={}",
                    session.key,
                    part_number,
                    e
                );
                e
            })?;

        tracing::debug!("Uploaded part: key={}, part={}, size={}", session.key, part_number, size);
        Ok(part)
    }

    /// Submit the ordered part list and close the session / 完成分片上传
    pub async fn complete_multipart(&self, session: MultipartSession) -> Result<()> {
        let parts = session.ordered_parts()?;
        let count = parts.len();
        self.call(self.backend().complete_multipart(
            &session.bucket,
            &session.key,
            &session.upload_id,
            parts,
        ))
        .await?;

        tracing::info!(
            "Multipart upload completed: bucket={}, key={}, parts={}",
            session.bucket,
            session.key,
            count
        );
        Ok(())
    }

    /// Abandon the session and release stored parts / 中止分片上传
    pub async fn abort_multipart(&self, session: MultipartSession) -> Result<()> {
        self.call(self.backend().abort_multipart(&session.bucket, &session.key, &session.upload_id))
            .await?;
        tracing::info!("Multipart upload aborted: bucket={}, key={}", session.bucket, session.key);
        Ok(())
    }

    /// Stream `reader` as a multipart upload in `multipart_chunk_size` parts / 分片上传数据流
    ///
    /// Produces `ceil(len / chunk)` parts, or a single empty part for empty
    /// input. A failed part stops the transfer; the session is aborted when
    /// `abort_multipart_on_failure` is set and left to the service otherwise.
    pub async fn upload_multipart<R>(
        &self,
        container: Option<&str>,
        key: &str,
        mut reader: R,
        content_type: Option<&str>,
        overwrite: bool,
    ) -> Result<MultipartSummary>
    where
        R: AsyncRead + Unpin + Send,
    {
        Self::require_key(key)?;
        if !overwrite && self.exists(container, key).await {
            tracing::warn!(
                "Multipart upload skipped because target exists and overwrite=false: key={}",
                key
            );
            return Ok(MultipartSummary {
                parts: 0,
                bytes: 0,
                skipped: true,
            });
        }

        let mut session = self.initiate_multipart(container, key, content_type).await?;
        let chunk_size = self.config().multipart_chunk_size;
        let concurrency = self.config().multipart_concurrency;

        let transfer = async {
            let mut pending = FuturesUnordered::new();
            let mut completed: Vec<CompletedPart> = Vec::new();
            let mut part_number = 0u32;
            let mut total = 0u64;

            loop {
                let chunk = read_chunk(&mut reader, chunk_size).await.map_err(|e| {
                    StorageError::Transport(format!("failed to read upload source: {}", e))
                })?;
                if chunk.is_empty() && part_number > 0 {
                    break;
                }

                part_number += 1;
                total += chunk.len() as u64;
                let last = chunk.len() < chunk_size;
                pending.push(self.upload_part(&session, part_number, chunk));

                // 并发数已满，等待一个分片完成
                if pending.len() >= concurrency {
                    if let Some(result) = pending.next().await {
                        completed.push(result?);
                    }
                }
                if last {
                    break;
                }
            }

            while let Some(result) = pending.next().await {
                completed.push(result?);
            }
            Ok::<_, StorageError>((completed, part_number, total))
        }
        .await;

        let (completed, parts, bytes) = match transfer {
            Ok(done) => done,
            Err(e) => {
                self.abandon(session).await;
                return Err(e);
            }
        };

        for part in completed {
            session.record_part(part)?;
        }
        self.complete_multipart(session).await?;

        Ok(MultipartSummary {
            parts,
            bytes,
            skipped: false,
        })
    }

    /// Multipart upload of a local file / 分片上传本地文件
    pub async fn upload_large_file(
        &self,
        container: Option<&str>,
        key: &str,
        source_file_path: impl AsRef<Path>,
        overwrite: bool,
    ) -> Result<MultipartSummary> {
        let path = source_file_path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| StorageError::SourceFileUnreadable {
                path: path.to_path_buf(),
                source,
            })?;
        let content_type = utils::content_type_for_path(&path.to_string_lossy());
        self.upload_multipart(container, key, file, Some(content_type), overwrite)
            .await
    }

    async fn abandon(&self, session: MultipartSession) {
        if !self.config().abort_multipart_on_failure {
            tracing::warn!(
                "Multipart session left open after failure: key={}, upload_id={}",
                session.key,
                session.upload_id
            );
            return;
        }
        let key = session.key.clone();
        if let Err(e) = self.abort_multipart(session).await {
            tracing::error!("Failed to abort multipart upload: key={}, error={}", key, e);
        }
    }
}
