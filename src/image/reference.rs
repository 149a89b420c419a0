use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const DEFAULT_DOMAIN: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";
const MAX_NAME_LEN: usize = 255;
const MAX_TAG_LEN: usize = 128;

/// Where an image lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// A remote registry.
    Docker,
    /// An OCI image layout directory on disk.
    OciLayout,
    /// The local content store.
    Storage,
}

impl Transport {
    pub fn name(self) -> &'static str {
        match self {
            Transport::Docker => "docker",
            Transport::OciLayout => "oci",
            Transport::Storage => "containers-storage",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "docker" => Some(Transport::Docker),
            "oci" => Some(Transport::OciLayout),
            "containers-storage" => Some(Transport::Storage),
            _ => None,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A resolved image location: transport, normalized name and tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLocation {
    pub transport: Transport,
    pub name: String,
    pub tag: String,
    /// Layout directory, only set for [`Transport::OciLayout`].
    pub layout_dir: Option<PathBuf>,
}

impl ImageLocation {
    /// The local-storage counterpart of this location.
    pub fn to_storage(&self) -> ImageLocation {
        ImageLocation {
            transport: Transport::Storage,
            name: self.name.clone(),
            tag: self.tag.clone(),
            layout_dir: None,
        }
    }
}

impl fmt::Display for ImageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.transport, &self.layout_dir) {
            (Transport::OciLayout, Some(dir)) => write!(f, "oci:{}:{}", dir.display(), self.tag),
            (Transport::Docker, _) => write!(f, "docker://{}:{}", self.name, self.tag),
            (transport, _) => write!(f, "{}:{}:{}", transport, self.name, self.tag),
        }
    }
}

/// A user-supplied image reference split into the location to fetch from and
/// the location in local storage it is pulled into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub raw: String,
    pub remote: ImageLocation,
    pub local: ImageLocation,
}

impl ImageRef {
    /// Parse `[transport:]name[:tag]`.
    ///
    /// Supported forms:
    /// - `node`, `registry:5000/foo/bar:1.0`, `docker://docker.io/library/node`
    /// - `oci:/path/to/layout[:tag]`
    /// - `containers-storage:localhost/image[:tag]`
    ///
    /// A prefix that is not a known transport is treated as part of a
    /// registry reference, so `localhost:5000/foo` keeps working.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::reference(raw, "empty image reference"));
        }

        let (transport, rest) = match trimmed.split_once(':') {
            Some((prefix, rest)) => match Transport::from_prefix(prefix) {
                Some(t) => (t, rest),
                None => (Transport::Docker, trimmed),
            },
            None => (Transport::Docker, trimmed),
        };

        let remote = match transport {
            Transport::Docker => {
                let rest = rest.strip_prefix("//").unwrap_or(rest);
                let (name, tag) = parse_named(raw, rest)?;
                ImageLocation {
                    transport,
                    name,
                    tag,
                    layout_dir: None,
                }
            }
            Transport::Storage => {
                let (name, tag) = parse_named(raw, rest)?;
                ImageLocation {
                    transport,
                    name,
                    tag,
                    layout_dir: None,
                }
            }
            Transport::OciLayout => parse_layout(raw, rest)?,
        };

        Ok(Self {
            raw: trimmed.to_string(),
            local: remote.to_storage(),
            remote,
        })
    }

    /// Whether the image has to be pulled into local storage first.
    pub fn needs_pull(&self) -> bool {
        self.remote.transport != self.local.transport
    }
}

/// Split `name:tag`, handling registry port syntax (`registry:5000/foo:bar`).
fn split_tag(image: &str) -> (&str, Option<&str>) {
    match image.rsplit_once(':') {
        Some((n, t)) if !t.contains('/') => (n, Some(t)),
        _ => (image, None),
    }
}

fn parse_named(raw: &str, image: &str) -> Result<(String, String)> {
    if image.contains('@') {
        return Err(Error::reference(raw, "digest references are not supported"));
    }

    let (name, tag) = split_tag(image);
    let tag = match tag {
        Some(t) => {
            validate_tag(raw, t)?;
            t.to_string()
        }
        None => DEFAULT_TAG.to_string(),
    };

    Ok((normalize_name(raw, name)?, tag))
}

fn validate_tag(raw: &str, tag: &str) -> Result<()> {
    let mut chars = tag.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if !valid_first || !valid_rest || tag.len() > MAX_TAG_LEN {
        return Err(Error::reference(raw, format!("invalid tag {tag:?}")));
    }
    Ok(())
}

/// Normalize a repository name: `node` becomes `docker.io/library/node`.
fn normalize_name(raw: &str, name: &str) -> Result<String> {
    let components: Vec<&str> = name.split('/').collect();

    let (domain, path) = match components.split_first() {
        Some((first, rest))
            if !rest.is_empty()
                && (first.contains('.') || first.contains(':') || *first == "localhost") =>
        {
            validate_domain(raw, first)?;
            (first.to_string(), rest.to_vec())
        }
        _ => (DEFAULT_DOMAIN.to_string(), components),
    };

    for component in &path {
        validate_path_component(raw, component)?;
    }

    let path = if domain == DEFAULT_DOMAIN && path.len() == 1 {
        format!("library/{}", path[0])
    } else {
        path.join("/")
    };

    let normalized = format!("{domain}/{path}");
    if normalized.len() > MAX_NAME_LEN {
        return Err(Error::reference(raw, "repository name too long"));
    }
    Ok(normalized)
}

fn validate_domain(raw: &str, domain: &str) -> Result<()> {
    let (host, port) = match domain.split_once(':') {
        Some((h, p)) => (h, Some(p)),
        None => (domain, None),
    };

    let host_ok = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'));
    let port_ok = port.is_none_or(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));

    if !host_ok || !port_ok {
        return Err(Error::reference(raw, format!("invalid registry {domain:?}")));
    }
    Ok(())
}

fn validate_path_component(raw: &str, component: &str) -> Result<()> {
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let valid = component.chars().next().is_some_and(alnum)
        && component.chars().last().is_some_and(alnum)
        && component
            .chars()
            .all(|c| alnum(c) || matches!(c, '.' | '_' | '-'));

    if !valid {
        return Err(Error::reference(
            raw,
            format!("invalid repository component {component:?}"),
        ));
    }
    Ok(())
}

/// `oci:<dir>[:<tag>]`. The image is named after the layout directory.
fn parse_layout(raw: &str, rest: &str) -> Result<ImageLocation> {
    let (dir, tag) = split_tag(rest);
    if dir.is_empty() {
        return Err(Error::reference(raw, "missing OCI layout directory"));
    }
    let tag = match tag {
        Some(t) => {
            validate_tag(raw, t)?;
            t.to_string()
        }
        None => DEFAULT_TAG.to_string(),
    };

    let dir = PathBuf::from(dir);
    let stem = layout_name(&dir)
        .ok_or_else(|| Error::reference(raw, "cannot derive an image name from the layout path"))?;

    Ok(ImageLocation {
        transport: Transport::OciLayout,
        name: format!("localhost/{stem}"),
        tag,
        layout_dir: Some(dir),
    })
}

fn layout_name(dir: &Path) -> Option<String> {
    let stem = dir.file_name()?.to_string_lossy().to_lowercase();
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}
