//! Versioned document store holding the desired and current state.
//!
//! Every commit names the revision it was based on. A commit based on a stale
//! revision is rejected with [`Error::Conflict`], which is how a concurrent
//! writer is detected.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

pub const DESIRED_PATH: &str = "orbiter.yml";
pub const CURRENT_PATH: &str = "internal/orbiter/current.yml";
pub const NODE_AGENTS_DESIRED_PATH: &str = "internal/orbiter/node-agents-desired.yml";
pub const NODE_AGENTS_CURRENT_PATH: &str = "internal/orbiter/node-agents-current.yml";

const REVISION_FILE: &str = ".revision";
const COMMITS_FILE: &str = ".commits";

/// A file written by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub path: String,
    pub content: Vec<u8>,
}

impl Document {
    pub fn new(path: &str, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.to_string(),
            content: content.into(),
        }
    }
}

/// One line of the commit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    pub revision: u64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub paths: Vec<String>,
}

/// Storage backend for state documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn revision(&self) -> Result<u64>;

    /// Reads a document. Missing documents are `None`.
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Writes all `files` as one new revision on top of `base`.
    async fn commit(&self, base: u64, files: Vec<Document>, message: &str) -> Result<u64>;
}

/// Directory backed [`DocumentStore`].
pub struct FsStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FsStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if path.is_empty()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::validation(format!("invalid document path {path:?}")));
        }
        Ok(self.root.join(rel))
    }

    async fn read_revision(&self) -> Result<u64> {
        match tokio::fs::read_to_string(self.root.join(REVISION_FILE)).await {
            Ok(s) => s
                .trim()
                .parse()
                .map_err(|e| Error::validation(format!("corrupt revision file: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads the commit log, oldest first.
    pub async fn history(&self) -> Result<Vec<CommitRecord>> {
        let content = match tokio::fs::read_to_string(self.root.join(COMMITS_FILE)).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l)
                    .map_err(|e| Error::validation(format!("corrupt commit log: {e}")))
            })
            .collect()
    }
}

async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl DocumentStore for FsStore {
    async fn revision(&self) -> Result<u64> {
        let _guard = self.lock.lock().await;
        self.read_revision().await
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn commit(&self, base: u64, files: Vec<Document>, message: &str) -> Result<u64> {
        let _guard = self.lock.lock().await;
        let actual = self.read_revision().await?;
        if actual != base {
            return Err(Error::Conflict {
                expected: base,
                actual,
            });
        }

        let resolved = files
            .iter()
            .map(|f| self.resolve(&f.path))
            .collect::<Result<Vec<_>>>()?;
        for (file, path) in files.iter().zip(&resolved) {
            write_atomic(path, &file.content).await?;
        }

        let revision = actual + 1;
        write_atomic(&self.root.join(REVISION_FILE), revision.to_string().as_bytes()).await?;

        let record = CommitRecord {
            revision,
            message: message.to_string(),
            timestamp: Utc::now(),
            paths: files.iter().map(|f| f.path.clone()).collect(),
        };
        let mut line = serde_json::to_string(&record)
            .map_err(|e| Error::validation(format!("encoding commit record: {e}")))?;
        line.push('\n');
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(COMMITS_FILE))
            .await?;
        log.write_all(line.as_bytes()).await?;
        log.flush().await?;

        debug!(revision, message, files = files.len(), "Committed documents");
        Ok(revision)
    }
}
