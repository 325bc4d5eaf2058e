//! File uploads.
//!
//! A view declares a named upload with [`UploadConfig`]. The client announces
//! the files it wants to send with `allow_upload`, receives one token per
//! entry, joins an `lvu:*` topic per entry with that token, then streams the
//! file as binary chunk frames:
//!
//! ```text
//! ┌───┬──────────┬─────────┬───────────┬───────────┬────────┬─────┬───────┬───────┬──────┐
//! │ 0 │ join_len │ ref_len │ topic_len │ event_len │ join   │ ref │ topic │ event │ data │
//! │u8 │ u8       │ u8      │ u8        │ u8        │ ref    │     │       │       │      │
//! └───┴──────────┴─────────┴───────────┴───────────┴────────┴─────┴───────┴───────┴──────┘
//! ```
//!
//! Chunks are appended to a staged file through a [`FileStager`]; progress
//! events mark entries done, after which the view consumes them.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::protocol::ProtocolError;

// ── Binary frames ────────────────────────────────────────────

/// Decoded binary chunk frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFrame {
    pub join_ref: Option<String>,
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub data: Vec<u8>,
}

impl ChunkFrame {
    const HEADER_LEN: usize = 5;

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < Self::HEADER_LEN {
            return Err(ProtocolError::InvalidFrame(format!("{} byte header", bytes.len())));
        }
        if bytes[0] != 0 {
            return Err(ProtocolError::InvalidFrame(format!("kind byte {}", bytes[0])));
        }
        let lengths = [
            bytes[1] as usize,
            bytes[2] as usize,
            bytes[3] as usize,
            bytes[4] as usize,
        ];
        let header_end = Self::HEADER_LEN + lengths.iter().sum::<usize>();
        if bytes.len() < header_end {
            return Err(ProtocolError::InvalidFrame("truncated header fields".into()));
        }

        let mut cursor = Self::HEADER_LEN;
        let mut fields = Vec::with_capacity(4);
        for len in lengths {
            let field = std::str::from_utf8(&bytes[cursor..cursor + len])
                .map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?;
            fields.push(field.to_string());
            cursor += len;
        }
        let event = fields.pop().unwrap_or_default();
        let topic = fields.pop().unwrap_or_default();
        let msg_ref = fields.pop().filter(|f| !f.is_empty());
        let join_ref = fields.pop().filter(|f| !f.is_empty());

        Ok(Self {
            join_ref,
            msg_ref,
            topic,
            event,
            data: bytes[header_end..].to_vec(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let join_ref = self.join_ref.as_deref().unwrap_or("");
        let msg_ref = self.msg_ref.as_deref().unwrap_or("");
        let fields = [join_ref, msg_ref, self.topic.as_str(), self.event.as_str()];

        let mut out = Vec::with_capacity(Self::HEADER_LEN + self.data.len() + 64);
        out.push(0);
        for field in fields {
            let len = u8::try_from(field.len())
                .map_err(|_| ProtocolError::InvalidFrame(format!("field of {} bytes", field.len())))?;
            out.push(len);
        }
        for field in fields {
            out.extend_from_slice(field.as_bytes());
        }
        out.extend_from_slice(&self.data);
        Ok(out)
    }
}

// ── Configuration and entries ────────────────────────────────

/// Constraints for one named upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadConfig {
    /// Accepted extensions (`.png`) or MIME types (`image/*`); empty accepts all.
    pub accept: Vec<String>,
    pub max_entries: usize,
    pub max_file_size: u64,
    pub chunk_size: usize,
    pub auto_upload: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            accept: Vec::new(),
            max_entries: 1,
            max_file_size: 10_000_000,
            chunk_size: 64_000,
            auto_upload: false,
        }
    }
}

impl UploadConfig {
    fn accepts(&self, entry: &UploadEntryMeta) -> bool {
        if self.accept.is_empty() {
            return true;
        }
        let name = entry.name.to_ascii_lowercase();
        let mime = entry.mime.to_ascii_lowercase();
        self.accept.iter().any(|rule| {
            let rule = rule.to_ascii_lowercase();
            if rule.starts_with('.') {
                name.ends_with(&rule)
            } else if let Some(family) = rule.strip_suffix("/*") {
                mime.split('/').next() == Some(family)
            } else {
                mime == rule
            }
        })
    }
}

/// Entry description sent by the client in `allow_upload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadEntryMeta {
    #[serde(rename = "ref")]
    pub entry_ref: String,
    pub name: String,
    #[serde(default)]
    pub relative_path: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime: String,
    #[serde(default)]
    pub last_modified: Option<u64>,
}

/// Server-side state of one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadEntry {
    pub meta: UploadEntryMeta,
    pub token: String,
    pub progress: u8,
    pub bytes_received: u64,
    pub staged: Option<PathBuf>,
}

impl UploadEntry {
    pub fn is_done(&self) -> bool {
        self.progress >= 100
    }
}

/// A completed entry handed to the view.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedEntry {
    pub meta: UploadEntryMeta,
    pub path: PathBuf,
}

/// One named upload and its entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub name: String,
    pub upload_ref: String,
    pub config: UploadConfig,
    pub entries: Vec<UploadEntry>,
}

impl Upload {
    /// Client-side configuration echoed in the `allow_upload` reply.
    pub fn client_config(&self) -> Value {
        json!({
            "chunk_size": self.config.chunk_size,
            "max_entries": self.config.max_entries,
            "max_file_size": self.config.max_file_size,
        })
    }

    /// Comma-separated accept attribute for the file input.
    pub fn accept_attr(&self) -> String {
        self.config.accept.join(",")
    }
}

/// All uploads declared by one view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Uploads {
    by_name: BTreeMap<String, Upload>,
}

impl Uploads {
    /// Declare (or redeclare) an upload; entries of a previous declaration are kept.
    pub fn allow(&mut self, name: &str, config: UploadConfig) -> &Upload {
        let upload = self.by_name.entry(name.to_string()).or_insert_with(|| Upload {
            name: name.to_string(),
            upload_ref: format!("phx-{}", Uuid::new_v4().simple()),
            config: config.clone(),
            entries: Vec::new(),
        });
        upload.config = config;
        upload
    }

    pub fn get(&self, name: &str) -> Option<&Upload> {
        self.by_name.get(name)
    }

    pub fn by_ref(&self, upload_ref: &str) -> Option<&Upload> {
        self.by_name.values().find(|u| u.upload_ref == upload_ref)
    }

    fn by_ref_mut(&mut self, upload_ref: &str) -> Result<&mut Upload, UploadError> {
        self.by_name
            .values_mut()
            .find(|u| u.upload_ref == upload_ref)
            .ok_or_else(|| UploadError::UnknownUpload(upload_ref.to_string()))
    }

    /// Validate and register announced entries, returning entry ref → token.
    pub fn register(
        &mut self,
        upload_ref: &str,
        entries: Vec<UploadEntryMeta>,
    ) -> Result<BTreeMap<String, String>, UploadError> {
        let upload = self.by_ref_mut(upload_ref)?;
        if entries.len() + upload.entries.len() > upload.config.max_entries {
            return Err(UploadError::TooManyFiles(upload.config.max_entries));
        }
        for entry in &entries {
            if entry.size > upload.config.max_file_size {
                return Err(UploadError::TooLarge(entry.entry_ref.clone()));
            }
            if !upload.config.accepts(entry) {
                return Err(UploadError::NotAccepted(entry.entry_ref.clone()));
            }
        }

        let mut tokens = BTreeMap::new();
        for meta in entries {
            let token = Uuid::new_v4().to_string();
            tokens.insert(meta.entry_ref.clone(), token.clone());
            upload.entries.push(UploadEntry {
                meta,
                token,
                progress: 0,
                bytes_received: 0,
                staged: None,
            });
        }
        Ok(tokens)
    }

    pub fn owns_token(&self, token: &str) -> bool {
        self.entry_by_token(token).is_some()
    }

    pub fn entry_by_token(&self, token: &str) -> Option<&UploadEntry> {
        self.by_name
            .values()
            .flat_map(|u| u.entries.iter())
            .find(|e| e.token == token)
    }

    fn entry_mut_by_token(&mut self, token: &str) -> Result<&mut UploadEntry, UploadError> {
        self.by_name
            .values_mut()
            .flat_map(|u| u.entries.iter_mut())
            .find(|e| e.token == token)
            .ok_or_else(|| UploadError::UnknownToken(token.to_string()))
    }

    /// Whether `len` more bytes still fit the entry holding `token`.
    pub fn check_chunk(&self, token: &str, len: u64) -> Result<(), UploadError> {
        let upload = self
            .by_name
            .values()
            .find(|u| u.entries.iter().any(|e| e.token == token))
            .ok_or_else(|| UploadError::UnknownToken(token.to_string()))?;
        let entry = upload
            .entries
            .iter()
            .find(|e| e.token == token)
            .ok_or_else(|| UploadError::UnknownToken(token.to_string()))?;
        if entry.bytes_received + len > upload.config.max_file_size {
            return Err(UploadError::TooLarge(entry.meta.entry_ref.clone()));
        }
        Ok(())
    }

    /// Account for `len` more bytes of the entry holding `token`, already
    /// written to `staged`.
    pub fn record_chunk(&mut self, token: &str, len: u64, staged: PathBuf) -> Result<(), UploadError> {
        self.check_chunk(token, len)?;
        let entry = self.entry_mut_by_token(token)?;
        entry.bytes_received += len;
        entry.staged = Some(staged);
        Ok(())
    }

    /// Chunk size limit for the entry holding `token`.
    pub fn chunk_limit(&self, token: &str) -> Option<usize> {
        self.by_name
            .values()
            .find(|u| u.entries.iter().any(|e| e.token == token))
            .map(|u| u.config.chunk_size)
    }

    pub fn set_progress(&mut self, upload_ref: &str, entry_ref: &str, progress: u8) -> Result<(), UploadError> {
        let upload = self.by_ref_mut(upload_ref)?;
        let entry = upload
            .entries
            .iter_mut()
            .find(|e| e.meta.entry_ref == entry_ref)
            .ok_or_else(|| UploadError::UnknownEntry(entry_ref.to_string()))?;
        entry.progress = progress.min(100);
        Ok(())
    }

    /// Take every completed entry of `name` out of the upload.
    pub fn consume(&mut self, name: &str) -> Vec<ConsumedEntry> {
        let Some(upload) = self.by_name.get_mut(name) else {
            return Vec::new();
        };
        let (done, pending): (Vec<_>, Vec<_>) = upload
            .entries
            .drain(..)
            .partition(|e| e.is_done() && e.staged.is_some());
        upload.entries = pending;
        done.into_iter()
            .filter_map(|e| e.staged.map(|path| ConsumedEntry { meta: e.meta, path }))
            .collect()
    }

    /// Remove an entry that was never finished.
    pub fn cancel(&mut self, name: &str, entry_ref: &str) -> Option<UploadEntry> {
        let upload = self.by_name.get_mut(name)?;
        let index = upload.entries.iter().position(|e| e.meta.entry_ref == entry_ref)?;
        Some(upload.entries.remove(index))
    }

    /// Staging keys of entries still held, for cleanup at teardown.
    pub fn pending_tokens(&self) -> Vec<String> {
        self.by_name
            .values()
            .flat_map(|u| u.entries.iter())
            .filter(|e| e.staged.is_some())
            .map(|e| e.token.clone())
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("unknown upload {0}")]
    UnknownUpload(String),

    #[error("unknown upload entry {0}")]
    UnknownEntry(String),

    #[error("unknown upload token {0}")]
    UnknownToken(String),

    #[error("too many files, at most {0}")]
    TooManyFiles(usize),

    #[error("entry {0} is too large")]
    TooLarge(String),

    #[error("entry {0} is not an accepted type")]
    NotAccepted(String),

    #[error("chunk of {0} bytes exceeds the configured chunk size")]
    ChunkTooLarge(usize),

    #[error("staging failed: {0}")]
    Io(#[from] io::Error),
}

impl UploadError {
    /// Short reason code sent back in an `allow_upload` reply.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TooManyFiles(_) => "too_many_files",
            Self::TooLarge(_) | Self::ChunkTooLarge(_) => "too_large",
            Self::NotAccepted(_) => "not_accepted",
            _ => "invalid",
        }
    }

    /// Entry the error refers to, when there is one.
    pub fn entry_ref(&self) -> Option<&str> {
        match self {
            Self::TooLarge(r) | Self::NotAccepted(r) | Self::UnknownEntry(r) => Some(r.as_str()),
            _ => None,
        }
    }
}

// ── Staging ──────────────────────────────────────────────────

/// Where uploaded bytes land before the view consumes them.
#[async_trait]
pub trait FileStager: Send + Sync {
    /// Create or truncate the staged file for `key`.
    async fn write(&self, key: &str, data: &[u8]) -> io::Result<PathBuf>;

    /// Append to the staged file for `key`, creating it if needed.
    async fn append(&self, key: &str, data: &[u8]) -> io::Result<PathBuf>;

    fn path_for(&self, key: &str) -> PathBuf;

    async fn remove(&self, key: &str) -> io::Result<()>;
}

/// Stages files as `<root>/<key>.upload`.
#[derive(Debug, Clone)]
pub struct TempDirStager {
    root: PathBuf,
}

impl TempDirStager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Stage under the OS temporary directory.
    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir().join("tessera-uploads"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sanitize(key: &str) -> String {
        key.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }
}

#[async_trait]
impl FileStager for TempDirStager {
    async fn write(&self, key: &str, data: &[u8]) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(key);
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }

    async fn append(&self, key: &str, data: &[u8]) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(key);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(path)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.upload", Self::sanitize(key)))
    }

    async fn remove(&self, key: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
