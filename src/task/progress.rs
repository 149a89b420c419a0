use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use crate::image::ProgressEvent;

/// Download progress of a single artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressEntry {
    /// Size of the artifact in bytes, -1 until known.
    pub total_size: i64,
    pub downloaded: u64,
}

impl ProgressEntry {
    pub fn unknown() -> Self {
        Self {
            total_size: -1,
            downloaded: 0,
        }
    }
}

/// Inconsistencies noticed while applying a progress event. They are logged,
/// never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressWarning {
    UnknownArtifact,
    DownloadedDecreased { previous: u64, reported: u64 },
    TotalSizeChanged { previous: i64, reported: i64 },
}

/// Per-artifact download progress of a pull, keyed by digest.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ProgressTracker {
    entries: BTreeMap<String, ProgressEntry>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the artifacts a pull is expected to report on.
    pub fn seed<I, S>(&mut self, digests: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for digest in digests {
            self.entries
                .entry(digest.into())
                .or_insert_with(ProgressEntry::unknown);
        }
    }

    /// Fold one event into the tracker. The event is always applied; any
    /// inconsistencies are logged and returned.
    pub fn apply(&mut self, event: &ProgressEvent) -> Vec<ProgressWarning> {
        let mut warnings = Vec::new();

        match self.entries.get(&event.digest) {
            None => {
                warn!(digest = %event.digest, "received progress report for an unknown layer");
                warnings.push(ProgressWarning::UnknownArtifact);
            }
            Some(current) => {
                if event.offset < current.downloaded {
                    warn!(
                        digest = %event.digest,
                        previous = current.downloaded,
                        reported = event.offset,
                        "downloaded size is smaller than the previous value"
                    );
                    warnings.push(ProgressWarning::DownloadedDecreased {
                        previous: current.downloaded,
                        reported: event.offset,
                    });
                }
                if current.total_size >= 0 && current.total_size != event.size {
                    warn!(
                        digest = %event.digest,
                        previous = current.total_size,
                        reported = event.size,
                        "total size of the layer changed"
                    );
                    warnings.push(ProgressWarning::TotalSizeChanged {
                        previous: current.total_size,
                        reported: event.size,
                    });
                }
            }
        }

        // A finished artifact is complete even if the last partial read was
        // never reported.
        let downloaded = match u64::try_from(event.size) {
            Ok(size) if event.kind.is_terminal() => size,
            _ => event.offset,
        };

        self.entries.insert(
            event.digest.clone(),
            ProgressEntry {
                total_size: event.size,
                downloaded,
            },
        );

        warnings
    }

    pub fn get(&self, digest: &str) -> Option<&ProgressEntry> {
        self.entries.get(digest)
    }

    pub fn entries(&self) -> &BTreeMap<String, ProgressEntry> {
        &self.entries
    }

    /// Bytes downloaded and bytes expected over all artifacts of known size.
    pub fn totals(&self) -> (u64, u64) {
        self.entries
            .values()
            .filter_map(|e| u64::try_from(e.total_size).ok().map(|t| (e.downloaded, t)))
            .fold((0, 0), |(d, t), (ed, et)| (d + ed, t + et))
    }
}
