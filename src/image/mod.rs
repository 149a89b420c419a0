pub mod archive;
pub mod layout;
pub mod manifest;
pub mod reference;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

pub use reference::{ImageLocation, ImageRef, Transport};

/// A single file entry within a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Full path within the layer
    pub path: String,

    /// File size in bytes
    pub size: u64,

    /// Whether this is a whiteout (deletion marker)
    pub is_whiteout: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEventKind {
    /// Transfer of the artifact is starting.
    New,
    /// More bytes arrived.
    Read,
    /// The artifact is complete.
    Done,
    /// The artifact was already present at the destination.
    Skipped,
}

impl ProgressEventKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressEventKind::Done | ProgressEventKind::Skipped)
    }
}

/// Progress report for one artifact of a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub digest: String,
    /// Size of the artifact, -1 if unknown.
    pub size: i64,
    /// Bytes transferred so far.
    pub offset: u64,
    pub kind: ProgressEventKind,
}

/// Metadata about an image as reported by its source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    /// Digest of the image manifest.
    #[serde(default)]
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub env: Vec<String>,
    /// Layer digests, base first.
    #[serde(default)]
    pub layers: Vec<String>,
}

/// Fetches images from their source into local storage.
#[async_trait]
pub trait Puller: Send + Sync {
    async fn inspect(&self, remote: &ImageLocation) -> Result<InspectInfo>;

    /// Copy `remote` into local storage at `local`, reporting per-layer
    /// progress on `progress`. The sender is dropped when the pull ends.
    async fn pull(
        &self,
        remote: &ImageLocation,
        local: &ImageLocation,
        progress: mpsc::Sender<ProgressEvent>,
    ) -> Result<()>;
}

/// Materializes an image from local storage as an OCI layout directory.
#[async_trait]
pub trait Copier: Send + Sync {
    /// Returns the raw bytes of the manifest written to `dest`.
    async fn copy_to_layout(&self, local: &ImageLocation, dest: &Path) -> Result<Vec<u8>>;
}

/// Enumerates the files of a layer blob. Blocking.
pub trait LayerExtractor: Send + Sync {
    fn for_each_entry(&self, blob: &Path, on_entry: &mut dyn FnMut(FileEntry)) -> Result<()>;
}
