use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest as _, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::manifest::{
    self, ANNOTATION_REF_NAME, Descriptor, Digest, ImageConfig, ImageIndex, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST, Manifest,
};
use super::{Copier, ImageLocation, InspectInfo, ProgressEvent, ProgressEventKind, Puller, Transport};

const INDEX_FILE: &str = "index.json";
const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Moves images between OCI layout directories.
///
/// Local storage is a directory tree with one OCI layout per image name and
/// tag: `<store_root>/<escaped name>/<tag>/`. Sources can be any OCI layout
/// on disk (`oci:` references) or the store itself. Registry sources are not
/// handled here.
#[derive(Debug, Clone)]
pub struct LayoutTransport {
    store_root: PathBuf,
    chunk_size: usize,
}

/// A manifest resolved from a layout's index.
struct ResolvedImage {
    descriptor: Descriptor,
    manifest_bytes: Vec<u8>,
    manifest: Manifest,
}

impl LayoutTransport {
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Size of the reads used while copying blobs; one progress event is
    /// emitted per chunk.
    #[cfg(test)]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Directory holding the layout of `location` in local storage.
    pub fn store_dir(&self, location: &ImageLocation) -> PathBuf {
        self.store_root
            .join(location.name.replace(['/', ':'], "_"))
            .join(&location.tag)
    }

    fn source_dir(&self, location: &ImageLocation) -> Result<PathBuf> {
        match location.transport {
            Transport::OciLayout => location
                .layout_dir
                .clone()
                .ok_or_else(|| Error::Transport(format!("{location} has no layout directory"))),
            Transport::Storage => Ok(self.store_dir(location)),
            Transport::Docker => Err(Error::Transport(format!(
                "cannot fetch {location}: registry access is not available, \
                 provide the image as an OCI layout (oci:<dir>[:tag])"
            ))),
        }
    }

    /// Copy one blob, verifying its digest. Skips blobs already present with
    /// the expected size.
    async fn copy_blob(
        &self,
        src_dir: &Path,
        dest_dir: &Path,
        descriptor: &Descriptor,
        progress: Option<&mpsc::Sender<ProgressEvent>>,
    ) -> Result<()> {
        let digest = descriptor.digest()?;
        let src = digest.blob_path(src_dir);
        let dest = digest.blob_path(dest_dir);

        if let Ok(meta) = fs::metadata(&dest).await {
            if meta.len() == descriptor.size {
                debug!(%digest, "blob already present");
                report(progress, descriptor, descriptor.size, ProgressEventKind::Skipped).await;
                return Ok(());
            }
        }

        report(progress, descriptor, 0, ProgressEventKind::New).await;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&dest);

        let mut input = fs::File::open(&src)
            .await
            .map_err(|e| Error::Transport(format!("cannot open blob {}: {e}", src.display())))?;
        let copied = self
            .stream_blob(&mut input, &partial, descriptor, progress)
            .await
            .and_then(|(offset, actual)| {
                if digest.algorithm() == "sha256" && actual != digest.hex() {
                    return Err(Error::Transport(format!(
                        "digest mismatch for {digest}: got sha256:{actual}"
                    )));
                }
                Ok(offset)
            });
        let offset = match copied {
            Ok(offset) => offset,
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        commit(&partial, &dest, descriptor.size).await?;
        report(progress, descriptor, offset, ProgressEventKind::Done).await;
        Ok(())
    }

    /// Write `input` to `partial` chunk by chunk. Returns the byte count and
    /// the sha256 of what was written.
    async fn stream_blob(
        &self,
        input: &mut fs::File,
        partial: &Path,
        descriptor: &Descriptor,
        progress: Option<&mpsc::Sender<ProgressEvent>>,
    ) -> Result<(u64, String)> {
        let mut output = fs::File::create(partial).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut offset = 0u64;

        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            output.write_all(&buf[..n]).await?;
            offset += n as u64;
            report(progress, descriptor, offset, ProgressEventKind::Read).await;
        }
        output.flush().await?;

        Ok((offset, format!("{:x}", hasher.finalize())))
    }
}

/// A temporary sibling of `dest` that no other writer uses.
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.partial", Uuid::new_v4().simple()));
    dest.with_file_name(name)
}

/// Move a finished temporary file onto `dest`. A failed rename still counts
/// when another writer already put a file of the expected size there.
async fn commit(partial: &Path, dest: &Path, expected_size: u64) -> Result<()> {
    match fs::rename(partial, dest).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(partial).await;
            match fs::metadata(dest).await {
                Ok(meta) if meta.len() == expected_size => {
                    debug!(path = %dest.display(), "blob stored by a concurrent copy");
                    Ok(())
                }
                _ => Err(Error::Io(e)),
            }
        }
    }
}

/// Replace `dest` with `data` without exposing a half-written file.
async fn write_atomic(dest: &Path, data: &[u8]) -> Result<()> {
    let partial = partial_path(dest);
    fs::write(&partial, data).await?;
    commit(&partial, dest, data.len() as u64).await
}

async fn report(
    progress: Option<&mpsc::Sender<ProgressEvent>>,
    descriptor: &Descriptor,
    offset: u64,
    kind: ProgressEventKind,
) {
    if let Some(tx) = progress {
        // A closed receiver only means nobody is watching anymore
        let _ = tx
            .send(ProgressEvent {
                digest: descriptor.digest.clone(),
                size: i64::try_from(descriptor.size).unwrap_or(i64::MAX),
                offset,
                kind,
            })
            .await;
    }
}

async fn resolve(dir: &Path, tag: &str) -> Result<ResolvedImage> {
    let index_path = dir.join(INDEX_FILE);
    let data = fs::read(&index_path).await.map_err(|e| match e.kind() {
        ErrorKind::NotFound => Error::NotFound(format!("no OCI layout at {}", dir.display())),
        _ => Error::Io(e),
    })?;
    let index = ImageIndex::from_slice(&data)?;

    let descriptor = index
        .select(tag)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("tag {tag:?} in {}", dir.display())))?;

    let manifest_bytes = fs::read(descriptor.digest()?.blob_path(dir)).await?;
    let manifest = Manifest::from_slice(&manifest_bytes)?;

    Ok(ResolvedImage {
        descriptor,
        manifest_bytes,
        manifest,
    })
}

async fn write_layout(dir: &Path, descriptor: Descriptor) -> Result<()> {
    let index = ImageIndex {
        schema_version: 2,
        media_type: Some(MEDIA_TYPE_OCI_INDEX.to_string()),
        manifests: vec![descriptor],
    };
    let data = serde_json::to_vec_pretty(&index)
        .map_err(|e| Error::Transport(format!("failed to encode index.json: {e}")))?;
    write_atomic(&dir.join(INDEX_FILE), &data).await?;
    write_atomic(&dir.join(OCI_LAYOUT_FILE), OCI_LAYOUT_CONTENT.as_bytes()).await?;
    Ok(())
}

/// Rewrite the Docker v2 media types of a manifest to their OCI equivalents.
fn to_oci_manifest(raw: &[u8]) -> Result<Vec<u8>> {
    fn rewrite(value: &mut serde_json::Value) {
        if let Some(serde_json::Value::String(media_type)) = value.get_mut("mediaType") {
            *media_type = manifest::oci_media_type(media_type.as_str()).to_string();
        }
    }

    let mut value: serde_json::Value = serde_json::from_slice(raw).map_err(Error::ManifestDecode)?;
    rewrite(&mut value);
    if let Some(config) = value.get_mut("config") {
        rewrite(config);
    }
    if let Some(serde_json::Value::Array(layers)) = value.get_mut("layers") {
        layers.iter_mut().for_each(rewrite);
    }

    serde_json::to_vec(&value).map_err(Error::ManifestDecode)
}

#[async_trait]
impl Puller for LayoutTransport {
    async fn inspect(&self, remote: &ImageLocation) -> Result<InspectInfo> {
        let dir = self.source_dir(remote)?;
        let image = resolve(&dir, &remote.tag).await?;

        let config_bytes = fs::read(image.manifest.config.digest()?.blob_path(&dir)).await?;
        let config = ImageConfig::from_slice(&config_bytes)?;
        let container = config.config.unwrap_or_default();

        Ok(InspectInfo {
            name: remote.name.clone(),
            tag: remote.tag.clone(),
            digest: image.descriptor.digest.clone(),
            created: config.created,
            architecture: config.architecture,
            os: config.os,
            labels: container.labels.unwrap_or_default(),
            env: container.env.unwrap_or_default(),
            layers: image.manifest.layers.iter().map(|l| l.digest.clone()).collect(),
        })
    }

    async fn pull(
        &self,
        remote: &ImageLocation,
        local: &ImageLocation,
        progress: mpsc::Sender<ProgressEvent>,
    ) -> Result<()> {
        if local.transport != Transport::Storage {
            return Err(Error::Transport(format!("cannot pull into {local}")));
        }
        let src = self.source_dir(remote)?;
        let dest = self.store_dir(local);
        info!(source = %remote, destination = %local, "pulling image into local storage");

        let image = resolve(&src, &remote.tag).await?;
        fs::create_dir_all(&dest).await?;

        self.copy_blob(&src, &dest, &image.manifest.config, None).await?;
        for layer in &image.manifest.layers {
            self.copy_blob(&src, &dest, layer, Some(&progress)).await?;
        }
        self.copy_blob(&src, &dest, &image.descriptor, None).await?;

        let mut descriptor = image.descriptor;
        descriptor
            .annotations
            .insert(ANNOTATION_REF_NAME.to_string(), local.tag.clone());
        write_layout(&dest, descriptor).await?;

        debug!(path = %dest.display(), "image stored");
        Ok(())
    }
}

#[async_trait]
impl Copier for LayoutTransport {
    async fn copy_to_layout(&self, local: &ImageLocation, dest: &Path) -> Result<Vec<u8>> {
        let src = self.source_dir(local)?;
        info!(source = %local, destination = %dest.display(), "copying image into OCI layout");

        let image = resolve(&src, &local.tag).await?;
        fs::create_dir_all(dest).await?;

        self.copy_blob(&src, dest, &image.manifest.config, None).await?;
        for layer in &image.manifest.layers {
            self.copy_blob(&src, dest, layer, None).await?;
        }

        let manifest_bytes = to_oci_manifest(&image.manifest_bytes)?;
        let digest = Digest::sha256_of(&manifest_bytes);
        let path = digest.blob_path(dest);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &manifest_bytes).await?;

        let mut descriptor = Descriptor {
            media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
            digest: digest.to_string(),
            size: manifest_bytes.len() as u64,
            annotations: Default::default(),
        };
        descriptor
            .annotations
            .insert(ANNOTATION_REF_NAME.to_string(), local.tag.clone());
        write_layout(dest, descriptor).await?;

        Ok(manifest_bytes)
    }
}
