//! Blob-store backend on S3
//!
//! Bucket layout, per tenant:
//!
//! ```text
//! {prefix}{tenant}/objects/<kind>/<hash>   object bytes (zstd above threshold)
//! {prefix}{tenant}/refs/<name>             {"target": "<hash>"} (`/` → `|`)
//! {prefix}{tenant}/logs/<seq>.json         one object per audit entry
//! ```
//!
//! Object reads assume S3's read-after-write consistency for puts; refs
//! rely on conditional writes (`If-None-Match` / `If-Match`), never on
//! listing, so callers must tolerate higher `Conflict` rates than the
//! relational backends. Log appends are conditional creates, which makes
//! a duplicate sequence number a `Conflict` rather than an overwrite.
//! Enable with the `s3` feature.

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use aws_sdk_s3::Client as S3Client;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;

use super::{ObjectStream, StorageBackend};
use crate::audit::AuditEntry;
use crate::error::{EngramError, Result};
use crate::types::ObjectKind;

/// Default byte size above which payloads are zstd-compressed.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 1024;

const ZSTD_LEVEL: i32 = 3;
const CONTENT_TYPE_ZSTD: &str = "application/zstd";
const CONTENT_TYPE_RAW: &str = "application/octet-stream";
const CONTENT_TYPE_JSON: &str = "application/json";

pub struct S3Backend {
    client: S3Client,
    bucket: String,
    prefix: String,
    tenant: String,
    compress_threshold: usize,
    sqs: Option<SqsNotifier>,
}

#[derive(Clone)]
struct SqsNotifier {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

fn unavailable(e: impl std::fmt::Display) -> EngramError {
    EngramError::BackendUnavailable { cause: e.to_string() }
}

fn sdk_status<E>(err: &SdkError<E>) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

/// Conditional-write rejections: 412 Precondition Failed, or 409 when two
/// conditional creates race.
fn is_conditional_failure<E>(err: &SdkError<E>) -> bool {
    matches!(sdk_status(err), Some(412) | Some(409))
}

impl S3Backend {
    /// Create a backend for one tenant. Credentials and region resolve
    /// through the standard SDK chain (env, profile, instance role).
    pub async fn new(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        tenant: &str,
        sqs_queue_url: Option<String>,
        compress_threshold: usize,
    ) -> Result<Self> {
        let config = aws_config::load_from_env().await;
        let client = S3Client::new(&config);
        let sqs = sqs_queue_url.map(|queue_url| SqsNotifier {
            client: aws_sdk_sqs::Client::new(&config),
            queue_url,
        });

        let backend = S3Backend {
            client,
            bucket: bucket.into(),
            prefix: prefix.into(),
            tenant: tenant.to_string(),
            compress_threshold,
            sqs,
        };
        backend.initialize().await?;
        Ok(backend)
    }

    fn object_key(&self, kind: ObjectKind, hash: &str) -> String {
        format!("{}{}/objects/{}/{}", self.prefix, self.tenant, kind, hash)
    }

    fn ref_key(&self, name: &str) -> String {
        // Keep ref names bucket-friendly but reversible.
        let safe = name.replace('/', "|");
        format!("{}{}/refs/{}", self.prefix, self.tenant, safe)
    }

    fn log_prefix(&self) -> String {
        format!("{}{}/logs/", self.prefix, self.tenant)
    }

    fn log_key(&self, seq: u64) -> String {
        // Zero-padded so lexicographic listing equals sequence order.
        format!("{}{:020}.json", self.log_prefix(), seq)
    }

    fn maybe_compress(&self, data: &[u8]) -> Result<(Vec<u8>, &'static str)> {
        if data.len() >= self.compress_threshold {
            let compressed = zstd::stream::encode_all(data, ZSTD_LEVEL)
                .map_err(|e| unavailable(format!("zstd compress: {e}")))?;
            Ok((compressed, CONTENT_TYPE_ZSTD))
        } else {
            Ok((data.to_vec(), CONTENT_TYPE_RAW))
        }
    }

    fn maybe_decompress(data: Vec<u8>, content_type: Option<&str>) -> Result<Vec<u8>> {
        if content_type == Some(CONTENT_TYPE_ZSTD) {
            zstd::stream::decode_all(data.as_slice())
                .map_err(|e| unavailable(format!("zstd decompress: {e}")))
        } else {
            Ok(data)
        }
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(resp) => {
                let content_type = resp.content_type().map(|s| s.to_string());
                let bytes = resp
                    .body
                    .collect()
                    .await
                    .map_err(unavailable)?
                    .into_bytes()
                    .to_vec();
                Ok(Some(Self::maybe_decompress(bytes, content_type.as_deref())?))
            }
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(unavailable(service_err))
                }
            }
        }
    }

    async fn put_bytes(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .server_side_encryption(ServerSideEncryption::Aes256)
            .send()
            .await
            .map_err(|e| unavailable(e.into_service_error()))?;
        Ok(())
    }

    async fn key_exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(unavailable(service_err))
                }
            }
        }
    }

    /// Read a ref's target plus the ETag needed for a conditional update.
    async fn read_ref(&self, name: &str) -> Result<Option<(String, String)>> {
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.ref_key(name))
            .send()
            .await
        {
            Ok(resp) => {
                let etag = resp.e_tag().unwrap_or_default().to_string();
                let bytes = resp
                    .body
                    .collect()
                    .await
                    .map_err(unavailable)?
                    .into_bytes()
                    .to_vec();
                let value: serde_json::Value = serde_json::from_slice(&bytes)?;
                Ok(value["target"]
                    .as_str()
                    .map(|target| (target.to_string(), etag)))
            }
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(unavailable(service_err))
                }
            }
        }
    }

    fn ref_body(target: &str) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&serde_json::json!({ "target": target }))?)
    }

    /// List keys under a prefix, optionally starting strictly after a key.
    async fn list_keys(&self, prefix: &str, start_after: Option<String>) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(after) = &start_after {
                req = req.start_after(after);
            }
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| unavailable(e.into_service_error()))?;

            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }

            if resp.is_truncated().unwrap_or(false) {
                continuation = resp.next_continuation_token().map(|s| s.to_string());
            } else {
                return Ok(keys);
            }
        }
    }

    fn notify_log_append(&self, entry: &AuditEntry) {
        let Some(notifier) = self.sqs.clone() else {
            return;
        };
        let body = serde_json::json!({
            "tenant": self.tenant,
            "seq": entry.seq,
            "action": entry.action,
            "actor": entry.actor,
            "commit_hash": entry.commit_hash,
            "timestamp": entry.timestamp.to_rfc3339(),
        })
        .to_string();

        // Fire and forget: the commit path never blocks on the queue.
        tokio::spawn(async move {
            let result = notifier
                .client
                .send_message()
                .queue_url(&notifier.queue_url)
                .message_body(body)
                .send()
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, "audit notification to SQS failed");
            }
        });
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    /// S3 is schema-less; verify bucket access with a cheap HEAD.
    async fn initialize(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                unavailable(format!(
                    "bucket '{}' not accessible: {}",
                    self.bucket,
                    e.into_service_error()
                ))
            })?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn healthcheck(&self) -> Result<()> {
        self.initialize().await
    }

    async fn put_object(&self, kind: ObjectKind, hash: &str, data: &[u8]) -> Result<()> {
        let key = self.object_key(kind, hash);
        // Content-addressed objects are immutable; skip re-uploads.
        if self.key_exists(&key).await? {
            return Ok(());
        }
        let (body, content_type) = self.maybe_compress(data)?;
        self.put_bytes(&key, body, content_type).await
    }

    async fn get_object(&self, kind: ObjectKind, hash: &str) -> Result<Option<Vec<u8>>> {
        self.get_bytes(&self.object_key(kind, hash)).await
    }

    async fn has_object(&self, kind: ObjectKind, hash: &str) -> Result<bool> {
        self.key_exists(&self.object_key(kind, hash)).await
    }

    async fn delete_object(&self, kind: ObjectKind, hash: &str) -> Result<bool> {
        let key = self.object_key(kind, hash);
        if !self.key_exists(&key).await? {
            return Ok(false);
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| unavailable(e.into_service_error()))?;
        Ok(true)
    }

    async fn iter_objects(&self, kind: ObjectKind) -> Result<ObjectStream<'_>> {
        let prefix = format!("{}{}/objects/{}/", self.prefix, self.tenant, kind);
        let keys = self.list_keys(&prefix, None).await?;

        let stream = stream::iter(keys.into_iter()).then(move |key| {
            let prefix = prefix.clone();
            async move {
                let hash = key
                    .strip_prefix(&prefix)
                    .unwrap_or(key.as_str())
                    .to_string();
                let bytes = self
                    .get_bytes(&key)
                    .await?
                    .ok_or(EngramError::NotFound { hash: hash.clone() })?;
                Ok((hash, bytes))
            }
        });
        Ok(stream.boxed())
    }

    async fn get_ref(&self, name: &str) -> Result<Option<String>> {
        Ok(self.read_ref(name).await?.map(|(target, _)| target))
    }

    async fn set_ref(&self, name: &str, target: &str) -> Result<()> {
        self.put_bytes(&self.ref_key(name), Self::ref_body(target)?, CONTENT_TYPE_JSON)
            .await
    }

    async fn delete_ref(&self, name: &str) -> Result<bool> {
        let key = self.ref_key(name);
        if !self.key_exists(&key).await? {
            return Ok(false);
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| unavailable(e.into_service_error()))?;
        Ok(true)
    }

    async fn list_refs(&self) -> Result<HashMap<String, String>> {
        let prefix = format!("{}{}/refs/", self.prefix, self.tenant);
        let keys = self.list_keys(&prefix, None).await?;

        let mut map = HashMap::new();
        for key in keys {
            let name = key
                .strip_prefix(&prefix)
                .unwrap_or(key.as_str())
                .replace('|', "/");
            if let Some(bytes) = self.get_bytes(&key).await? {
                let value: serde_json::Value =
                    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
                if let Some(target) = value["target"].as_str() {
                    map.insert(name, target.to_string());
                }
            }
        }
        Ok(map)
    }

    async fn cas_ref(&self, name: &str, expected: Option<&str>, target: &str) -> Result<()> {
        let conflict = |actual: Option<String>| EngramError::Conflict {
            name: name.to_string(),
            expected: expected.map(|s| s.to_string()),
            actual,
        };
        let key = self.ref_key(name);
        let body = Self::ref_body(target)?;

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .content_type(CONTENT_TYPE_JSON)
            .server_side_encryption(ServerSideEncryption::Aes256);

        let request = match expected {
            None => request.if_none_match("*"),
            Some(expected_target) => {
                let (actual, etag) = match self.read_ref(name).await? {
                    Some(found) => found,
                    None => return Err(conflict(None)),
                };
                if actual != expected_target {
                    return Err(conflict(Some(actual)));
                }
                request.if_match(etag)
            }
        };

        match request.send().await {
            Ok(_) => Ok(()),
            Err(e) if is_conditional_failure(&e) => {
                let actual = self.get_ref(name).await.ok().flatten();
                Err(conflict(actual))
            }
            Err(e) => Err(unavailable(e.into_service_error())),
        }
    }

    async fn append_log(&self, entry: &AuditEntry) -> Result<()> {
        let key = self.log_key(entry.seq);
        let body = serde_json::to_vec(entry)?;

        // Conditional create: a duplicate sequence number is a Conflict,
        // never an overwrite.
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .content_type(CONTENT_TYPE_JSON)
            .server_side_encryption(ServerSideEncryption::Aes256)
            .if_none_match("*")
            .send()
            .await;

        match result {
            Ok(_) => {
                self.notify_log_append(entry);
                Ok(())
            }
            Err(e) if is_conditional_failure(&e) => Err(EngramError::Conflict {
                name: format!("log:{}", entry.seq),
                expected: None,
                actual: Some(entry.seq.to_string()),
            }),
            Err(e) => Err(unavailable(e.into_service_error())),
        }
    }

    async fn read_log(&self, start_seq: u64, limit: usize) -> Result<Vec<AuditEntry>> {
        let start_after = if start_seq == 0 {
            None
        } else {
            Some(self.log_key(start_seq - 1))
        };
        let keys = self.list_keys(&self.log_prefix(), start_after).await?;

        let mut entries = Vec::new();
        for key in keys.into_iter().take(limit) {
            if let Some(bytes) = self.get_bytes(&key).await? {
                let entry: AuditEntry = serde_json::from_slice(&bytes)
                    .map_err(|e| EngramError::Serialization(e.to_string()))?;
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }
}
