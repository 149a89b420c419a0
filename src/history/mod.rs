pub mod store;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::image::InspectInfo;
use crate::tree::LayerSet;

pub use store::HistoryStore;

/// One analyzed revision of an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHistoryEntry {
    /// Assigned by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub contents: LayerSet,
    #[serde(default)]
    pub inspect_info: InspectInfo,
}

impl ImageHistoryEntry {
    pub fn new(tags: Vec<String>, contents: LayerSet, inspect_info: InspectInfo) -> Self {
        Self {
            id: None,
            tags,
            contents,
            inspect_info,
        }
    }
}

/// All known revisions of an image, keyed by manifest digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHistory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub history: BTreeMap<String, ImageHistoryEntry>,
}

impl ImageHistory {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            history: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, digest: impl Into<String>, entry: ImageHistoryEntry) -> Self {
        self.history.insert(digest.into(), entry);
        self
    }
}
