use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Identifies whose artifacts these are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveTarget {
    pub experiment_id: String,
    /// Agent (host) that produced the files.
    pub agent_id: String,
}

/// Where an artifact lands in blob storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    pub experiment_id: String,
    pub agent_id: String,
    /// Workload folder, e.g. `speccpu`.
    pub folder: String,
    pub file_name: String,
    /// MIME type guessed from the file extension.
    pub content_type: String,
}

impl BlobDescriptor {
    pub fn new(target: &ArchiveTarget, folder: &str, source: &Path) -> Self {
        let file_name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            experiment_id: target.experiment_id.clone(),
            agent_id: target.agent_id.clone(),
            folder: folder.to_string(),
            content_type: content_type_for(&file_name).to_string(),
            file_name,
        }
    }

    /// Pairs each file with its descriptor.
    pub fn for_files(target: &ArchiveTarget, folder: &str, files: &[PathBuf]) -> Vec<(PathBuf, BlobDescriptor)> {
        files
            .iter()
            .map(|file| (file.clone(), BlobDescriptor::new(target, folder, file)))
            .collect()
    }

    /// `{experiment}/{agent}/{folder}/{file}`
    pub fn blob_path(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.experiment_id, self.agent_id, self.folder, self.file_name
        )
    }
}

fn content_type_for(file_name: &str) -> &'static str {
    let extension = Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());
    match extension.as_deref() {
        Some("txt" | "log" | "debug" | "cfg") => "text/plain",
        Some("json") => "application/json",
        Some("csv") => "text/csv",
        Some("html" | "htm") => "text/html",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Blob storage for run artifacts.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Stores the file at `source` under `blob`.
    async fn upload(&self, source: &Path, blob: &BlobDescriptor) -> Result<()>;
}

/// Copies artifacts under a local directory, laid out by blob path.
#[derive(Debug, Clone)]
pub struct DirectoryArtifactSink {
    root: PathBuf,
}

impl DirectoryArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactSink for DirectoryArtifactSink {
    async fn upload(&self, source: &Path, blob: &BlobDescriptor) -> Result<()> {
        let destination = self.root.join(blob.blob_path());
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(source, &destination).await?;
        debug!(source = %source.display(), destination = %destination.display(), "Archived artifact");
        Ok(())
    }
}
