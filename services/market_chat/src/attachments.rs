use crate::clock::Clock;
use crate::error::{ChatError, ChatResult};
use crate::model::{AttachmentRef, UploadFile};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use url::Url;
use uuid::Uuid;
use walkdir::WalkDir;

/// Leading bytes read when sniffing a stored blob's type.
const SNIFF_BYTES: u64 = 8 * 1024;

static UNSAFE_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").unwrap());

pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// A stored blob as seen by housekeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub path: String,
    pub size_bytes: u64,
    pub modified_ms: i64,
}

/// Path-addressed binary storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `path`. The blob becomes visible only once complete.
    async fn put(&self, path: &str, data: Bytes) -> Result<()>;
    async fn open(&self, path: &str) -> Result<Option<BlobReader>>;
    /// Size and age of a complete blob, `None` if nothing is stored there.
    async fn stat(&self, path: &str) -> Result<Option<BlobEntry>>;
    async fn delete(&self, path: &str) -> Result<()>;
    /// Blobs whose path starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>>;
    /// Fetchable URL for a stored path.
    fn url_for(&self, path: &str) -> String;
}

/// Blob store backed by a local directory and served under `/api/files/`.
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    root: PathBuf,
    public_url: Url,
}

impl FsBlobStore {
    pub fn new(root: PathBuf, public_url: Url) -> Self {
        Self { root, public_url }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if !is_valid_blob_path(path) {
            return Err(anyhow!("invalid blob path {path:?}"));
        }
        Ok(self.root.join(path))
    }
}

/// Relative path made only of plain segments.
pub fn is_valid_blob_path(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

fn modified_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis() as i64)
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).await?;
        }
        let partial = target.with_extension(format!("part-{}", Uuid::new_v4().simple()));
        fs::write(&partial, &data)
            .await
            .with_context(|| format!("writing {}", partial.display()))?;
        if let Err(e) = fs::rename(&partial, &target).await {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn open(&self, path: &str) -> Result<Option<BlobReader>> {
        let target = self.resolve(path)?;
        match fs::File::open(target).await {
            Ok(file) => Ok(Some(Box::pin(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, path: &str) -> Result<Option<BlobEntry>> {
        let target = self.resolve(path)?;
        match fs::metadata(target).await {
            Ok(meta) if meta.is_file() => Ok(Some(BlobEntry {
                path: path.to_string(),
                size_bytes: meta.len(),
                modified_ms: modified_ms(&meta),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        match fs::remove_file(target).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        let base = self.resolve(prefix)?;
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in WalkDir::new(&base).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                out.push(BlobEntry {
                    path: rel.to_string_lossy().replace('\\', "/"),
                    size_bytes: meta.len(),
                    modified_ms: modified_ms(&meta),
                });
            }
            out
        })
        .await
        .context("listing blobs")
    }

    fn url_for(&self, path: &str) -> String {
        match self.public_url.join(&format!("api/files/{path}")) {
            Ok(url) => url.to_string(),
            Err(_) => format!("/api/files/{path}"),
        }
    }
}

/// Directory prefix holding every blob of a conversation.
pub fn conversation_prefix(conversation_id: &Uuid) -> String {
    format!("conversations/{conversation_id}/")
}

/// Reduce a client-supplied file name to a safe single path segment.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned = UNSAFE_NAME_RE.replace_all(base, "_");
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".into()
    } else {
        cleaned.chars().take(120).collect()
    }
}

/// Storage path of an upload: conversation-scoped, keyed by time, a random
/// tag and the name. Same-name uploads within one millisecond stay distinct.
pub fn blob_path(conversation_id: &Uuid, uploaded_at_ms: i64, file_name: &str) -> String {
    let tag = Uuid::new_v4().simple().to_string();
    format!(
        "{}{}_{}_{}",
        conversation_prefix(conversation_id),
        uploaded_at_ms,
        &tag[..12],
        sanitize_file_name(file_name)
    )
}

/// Magic bytes first, then the extension of `name`.
pub fn sniff_mime(head: &[u8], name: &str) -> String {
    if let Some(kind) = infer::get(head) {
        return kind.mime_type().to_string();
    }
    mime_guess::from_path(name).first_or_octet_stream().to_string()
}

/// What the store actually holds under a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub size_bytes: u64,
    pub mime: String,
}

/// Size-bounded upload producing a reference usable inside a message.
#[derive(Clone)]
pub struct AttachmentPipeline {
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    max_bytes: u64,
}

impl AttachmentPipeline {
    pub fn new(blobs: Arc<dyn BlobStore>, clock: Arc<dyn Clock>, max_bytes: u64) -> Self {
        Self {
            blobs,
            clock,
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Reject oversize payloads before touching storage; otherwise store and
    /// return the reference once the write has completed.
    pub async fn upload(&self, conversation_id: &Uuid, file: UploadFile) -> ChatResult<AttachmentRef> {
        let size = file.data.len() as u64;
        if size > self.max_bytes {
            return Err(ChatError::SizeExceeded {
                size,
                limit: self.max_bytes,
            });
        }
        if size == 0 {
            return Err(ChatError::Invalid("empty_file".into()));
        }
        let path = blob_path(conversation_id, self.clock.now_ms(), &file.file_name);
        let head = &file.data[..file.data.len().min(SNIFF_BYTES as usize)];
        let mime = sniff_mime(head, &path);
        self.blobs
            .put(&path, file.data)
            .await
            .map_err(|e| ChatError::Upload(e.to_string()))?;
        tracing::info!(conversation = %conversation_id, %path, size, "attachment stored");
        Ok(AttachmentRef {
            url: self.blobs.url_for(&path),
            path,
            file_name: file.file_name,
            mime,
            size_bytes: size,
        })
    }

    /// Size and sniffed type of a stored blob.
    pub async fn inspect(&self, path: &str) -> Result<Option<StoredBlob>> {
        let Some(entry) = self.blobs.stat(path).await? else {
            return Ok(None);
        };
        let Some(reader) = self.blobs.open(path).await? else {
            return Ok(None);
        };
        let mut head = Vec::new();
        reader.take(SNIFF_BYTES).read_to_end(&mut head).await?;
        Ok(Some(StoredBlob {
            size_bytes: entry.size_bytes,
            mime: sniff_mime(&head, path),
        }))
    }

    /// Rebuild a client-supplied reference from what was really uploaded into
    /// this conversation. Only the path and display name are taken from the client.
    pub async fn verify(&self, conversation_id: &Uuid, claimed: &AttachmentRef) -> ChatResult<AttachmentRef> {
        let path = claimed.path.as_str();
        if !is_valid_blob_path(path) || !path.starts_with(&conversation_prefix(conversation_id)) {
            return Err(ChatError::Invalid("foreign_attachment".into()));
        }
        let stored = self
            .inspect(path)
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?
            .ok_or_else(|| ChatError::Invalid("attachment_missing".into()))?;
        let file_name = match claimed.file_name.trim() {
            "" => "file".to_string(),
            name => name.to_string(),
        };
        Ok(AttachmentRef {
            url: self.blobs.url_for(path),
            path: path.to_string(),
            file_name,
            mime: stored.mime,
            size_bytes: stored.size_bytes,
        })
    }
}
