use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Annotation carrying the tag of a manifest inside an OCI layout index.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// A content digest of the form `algorithm:hex`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| Error::DigestFormat(s.to_string()))?;

        let algorithm_ok = !algorithm.is_empty()
            && algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '_' | '-'));
        let hex_ok = !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit());

        if !algorithm_ok || !hex_ok {
            return Err(Error::DigestFormat(s.to_string()));
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_ascii_lowercase(),
        })
    }

    pub fn sha256_of(data: &[u8]) -> Self {
        use sha2::Digest as _;
        Self {
            algorithm: "sha256".to_string(),
            hex: format!("{:x}", sha2::Sha256::digest(data)),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Path of the blob with this digest inside an OCI layout directory.
    pub fn blob_path(&self, layout_dir: &Path) -> PathBuf {
        layout_dir.join("blobs").join(&self.algorithm).join(&self.hex)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn digest(&self) -> Result<Digest> {
        Digest::parse(&self.digest)
    }

    pub fn ref_name(&self) -> Option<&str> {
        self.annotations.get(ANNOTATION_REF_NAME).map(String::as_str)
    }
}

/// Top-level `index.json` of an OCI layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(Error::ManifestDecode)
    }

    /// Manifest tagged `tag`, or the only manifest of a single-image layout.
    pub fn select(&self, tag: &str) -> Option<&Descriptor> {
        self.manifests
            .iter()
            .find(|d| d.ref_name() == Some(tag))
            .or_else(|| match self.manifests.as_slice() {
                [only] => Some(only),
                _ => None,
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(Error::ManifestDecode)
    }

    /// Ensure the config and every layer carry the media types an extracted
    /// OCI layout is expected to contain.
    pub fn check_media_types(&self) -> Result<()> {
        expect_media_type(&self.config, MEDIA_TYPE_OCI_CONFIG)?;
        for layer in &self.layers {
            expect_media_type(layer, MEDIA_TYPE_OCI_LAYER_GZIP)?;
        }
        Ok(())
    }
}

fn expect_media_type(descriptor: &Descriptor, expected: &str) -> Result<()> {
    if descriptor.media_type != expected {
        return Err(Error::MediaTypeMismatch {
            expected: expected.to_string(),
            found: descriptor.media_type.clone(),
        });
    }
    Ok(())
}

/// OCI equivalent of a Docker v2 media type; other types pass through.
pub fn oci_media_type(media_type: &str) -> &str {
    match media_type {
        MEDIA_TYPE_DOCKER_MANIFEST => MEDIA_TYPE_OCI_MANIFEST,
        MEDIA_TYPE_DOCKER_CONFIG => MEDIA_TYPE_OCI_CONFIG,
        MEDIA_TYPE_DOCKER_LAYER => MEDIA_TYPE_OCI_LAYER,
        MEDIA_TYPE_DOCKER_LAYER_GZIP => MEDIA_TYPE_OCI_LAYER_GZIP,
        other => other,
    }
}

// ---- Image config (only the fields we read) ----

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub config: Option<ContainerConfig>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Labels", default)]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(rename = "Env", default)]
    pub env: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub empty_layer: bool,
}

impl ImageConfig {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(Error::ManifestDecode)
    }

    /// Commands of the history entries that produced a layer, base first.
    /// These line up 1:1 with the manifest's layers.
    pub fn layer_commands(&self) -> Vec<Option<&str>> {
        self.history
            .iter()
            .filter(|h| !h.empty_layer)
            .map(|h| h.created_by.as_deref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_digest() {
        let d = Digest::parse("sha256:ABCdef0123").unwrap();
        assert_eq!(d.algorithm(), "sha256");
        assert_eq!(d.hex(), "abcdef0123");
        assert_eq!(d.to_string(), "sha256:abcdef0123");
        assert_eq!(
            d.blob_path(Path::new("/layout")),
            PathBuf::from("/layout/blobs/sha256/abcdef0123")
        );
    }

    #[test]
    fn rejects_malformed_digests() {
        for bad in ["", "sha256", "sha256:", ":abc", "sha256:xyz", "sha256:ab:cd", "SHA256:abc"] {
            assert!(
                matches!(Digest::parse(bad), Err(Error::DigestFormat(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn sha256_of_known_input() {
        let d = Digest::sha256_of(b"hello world");
        assert_eq!(
            d.hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    fn manifest_json(config_type: &str, layer_type: &str) -> String {
        format!(
            r#"{{
                "schemaVersion": 2,
                "mediaType": "{MEDIA_TYPE_OCI_MANIFEST}",
                "config": {{"mediaType": "{config_type}", "digest": "sha256:aa", "size": 10}},
                "layers": [{{"mediaType": "{layer_type}", "digest": "sha256:bb", "size": 20}}]
            }}"#
        )
    }

    #[test]
    fn accepts_oci_media_types() {
        let m = Manifest::from_slice(
            manifest_json(MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_LAYER_GZIP).as_bytes(),
        )
        .unwrap();
        assert_eq!(m.layers.len(), 1);
        m.check_media_types().unwrap();
    }

    #[test]
    fn rejects_unexpected_media_types() {
        let m = Manifest::from_slice(
            manifest_json(MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_DOCKER_LAYER_GZIP).as_bytes(),
        )
        .unwrap();
        match m.check_media_types() {
            Err(Error::MediaTypeMismatch { expected, found }) => {
                assert_eq!(expected, MEDIA_TYPE_OCI_LAYER_GZIP);
                assert_eq!(found, MEDIA_TYPE_DOCKER_LAYER_GZIP);
            }
            other => panic!("expected media type mismatch, got {other:?}"),
        }

        let m = Manifest::from_slice(
            manifest_json(MEDIA_TYPE_DOCKER_CONFIG, MEDIA_TYPE_OCI_LAYER_GZIP).as_bytes(),
        )
        .unwrap();
        assert!(matches!(
            m.check_media_types(),
            Err(Error::MediaTypeMismatch { .. })
        ));
    }

    #[test]
    fn malformed_manifest_is_a_decode_error() {
        assert!(matches!(
            Manifest::from_slice(b"{not json"),
            Err(Error::ManifestDecode(_))
        ));
    }

    #[test]
    fn index_selects_by_tag_or_single_entry() {
        let index = ImageIndex::from_slice(
            br#"{"schemaVersion": 2, "manifests": [
                {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:01", "size": 1,
                 "annotations": {"org.opencontainers.image.ref.name": "3.0"}},
                {"mediaType": "application/vnd.oci.image.manifest.v1+json", "digest": "sha256:02", "size": 1,
                 "annotations": {"org.opencontainers.image.ref.name": "latest"}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(index.select("latest").unwrap().digest, "sha256:02");
        assert_eq!(index.select("3.0").unwrap().digest, "sha256:01");
        assert!(index.select("4.0").is_none());

        let single = ImageIndex {
            schema_version: 2,
            media_type: None,
            manifests: vec![index.manifests[0].clone()],
        };
        assert_eq!(single.select("anything").unwrap().digest, "sha256:01");
    }

    #[test]
    fn layer_commands_skip_empty_layers() {
        let config = ImageConfig::from_slice(
            br#"{"history": [
                {"created_by": "ADD rootfs.tar /"},
                {"created_by": "ENV FOO=bar", "empty_layer": true},
                {"created_by": "RUN make"},
                {}
            ]}"#,
        )
        .unwrap();
        assert_eq!(
            config.layer_commands(),
            vec![Some("ADD rootfs.tar /"), Some("RUN make"), None]
        );
    }

    #[test]
    fn maps_docker_media_types() {
        assert_eq!(oci_media_type(MEDIA_TYPE_DOCKER_LAYER_GZIP), MEDIA_TYPE_OCI_LAYER_GZIP);
        assert_eq!(oci_media_type(MEDIA_TYPE_DOCKER_CONFIG), MEDIA_TYPE_OCI_CONFIG);
        assert_eq!(oci_media_type("application/x-custom"), "application/x-custom");
    }
}
