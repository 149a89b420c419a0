//! Fixtures shared by the unit tests: layer tarballs and OCI layouts.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::image::manifest::{
    self, ANNOTATION_REF_NAME, Digest, MEDIA_TYPE_DOCKER_CONFIG, MEDIA_TYPE_DOCKER_LAYER_GZIP,
    MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_LAYER_GZIP,
    MEDIA_TYPE_OCI_MANIFEST,
};

#[derive(Debug, Clone, Copy)]
pub struct MediaTypes {
    pub manifest: &'static str,
    pub config: &'static str,
    pub layer: &'static str,
}

impl MediaTypes {
    pub const OCI: MediaTypes = MediaTypes {
        manifest: MEDIA_TYPE_OCI_MANIFEST,
        config: MEDIA_TYPE_OCI_CONFIG,
        layer: MEDIA_TYPE_OCI_LAYER_GZIP,
    };

    pub const DOCKER: MediaTypes = MediaTypes {
        manifest: MEDIA_TYPE_DOCKER_MANIFEST,
        config: MEDIA_TYPE_DOCKER_CONFIG,
        layer: MEDIA_TYPE_DOCKER_LAYER_GZIP,
    };
}

pub struct LayoutFixture {
    pub manifest_digest: String,
    /// Full `sha256:<hex>` digests of the layers, base first.
    pub layer_digests: Vec<String>,
}

/// A tar archive holding zero-filled files of the given sizes, with explicit
/// entries for their parent directories.
pub fn layer_tar(files: &[(&str, u64)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut dirs = BTreeSet::new();

    for (path, size) in files {
        let components: Vec<&str> = path.split('/').collect();
        for depth in 1..components.len() {
            let dir = format!("{}/", components[..depth].join("/"));
            if dirs.insert(dir.clone()) {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder
                    .append_data(&mut header, &dir, std::io::empty())
                    .unwrap();
            }
        }

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(*size);
        let data = vec![0u8; *size as usize];
        builder
            .append_data(&mut header, path, data.as_slice())
            .unwrap();
    }

    builder.into_inner().unwrap()
}

pub fn layer_tar_gz(files: &[(&str, u64)]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&layer_tar(files)).unwrap();
    encoder.finish().unwrap()
}

fn write_blob(layout: &Path, data: &[u8]) -> (String, u64) {
    let digest = Digest::sha256_of(data);
    let path = digest.blob_path(layout);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, data).unwrap();
    (digest.to_string(), data.len() as u64)
}

/// Write a single-image OCI layout to `dir`. Each layer is a list of files
/// plus the command recorded for it in the config history.
pub fn write_layout(
    dir: &Path,
    tag: &str,
    layers: &[(&[(&str, u64)], &str)],
    media: MediaTypes,
) -> LayoutFixture {
    let mut layer_descriptors = Vec::new();
    let mut layer_digests = Vec::new();
    let mut history = Vec::new();

    for (i, (files, created_by)) in layers.iter().enumerate() {
        let (digest, size) = write_blob(dir, &layer_tar_gz(files));
        layer_descriptors.push(serde_json::json!({
            "mediaType": media.layer,
            "digest": digest,
            "size": size,
        }));
        layer_digests.push(digest);
        history.push(serde_json::json!({ "created_by": created_by }));
        if i == 0 {
            history.push(serde_json::json!({ "created_by": "ENV PATH=/usr/bin", "empty_layer": true }));
        }
    }

    let config = serde_json::json!({
        "created": "2024-01-01T00:00:00Z",
        "architecture": "amd64",
        "os": "linux",
        "config": {
            "Labels": { "org.opencontainers.image.vendor": "layer-sizes tests" },
            "Env": ["PATH=/usr/bin"],
        },
        "rootfs": { "type": "layers", "diff_ids": [] },
        "history": history,
    });
    let (config_digest, config_size) = write_blob(dir, &serde_json::to_vec(&config).unwrap());

    let manifest_json = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media.manifest,
        "config": {
            "mediaType": media.config,
            "digest": config_digest,
            "size": config_size,
        },
        "layers": layer_descriptors,
    });
    let (manifest_digest, manifest_size) =
        write_blob(dir, &serde_json::to_vec(&manifest_json).unwrap());

    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": media.manifest,
            "digest": manifest_digest,
            "size": manifest_size,
            "annotations": { ANNOTATION_REF_NAME: tag },
        }],
    });
    std::fs::write(dir.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
    std::fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();

    // Sanity check the fixture with the real parser
    manifest::Manifest::from_slice(&serde_json::to_vec(&manifest_json).unwrap()).unwrap();

    LayoutFixture {
        manifest_digest,
        layer_digests,
    }
}
