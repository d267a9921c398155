use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// a filesystem diff, optionally stacked on a parent layer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    /// parent layer id (None for a base layer)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// read-only layers back images; writable ones back containers
    pub read_only: bool,
    /// digest of the uncompressed diff
    pub diff_digest: Digest,
    /// size of the uncompressed diff
    pub diff_size: u64,
    pub created: DateTime<Utc>,
}

/// size and digest of a named data item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BigDataInfo {
    pub digest: Digest,
    pub size: u64,
}

/// an image record: a top layer plus named data items and names
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    /// human-readable names (tags); each bound to at most one image
    #[serde(default)]
    pub names: Vec<String>,
    pub top_layer: String,
    /// opaque metadata string
    #[serde(default)]
    pub metadata: String,
    /// named data items (config, manifest, signatures); BTreeMap for stable order
    #[serde(default)]
    pub big_data: BTreeMap<String, BigDataInfo>,
    pub created: DateTime<Utc>,
}

impl Image {
    /// names of all attached data items
    pub fn big_data_names(&self) -> Vec<String> {
        self.big_data.keys().cloned().collect()
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// a working container: a writable layer on top of an optional image
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    /// image the container was created from (None for scratch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    /// the container's writable layer
    pub layer_id: String,
    #[serde(default)]
    pub metadata: String,
    pub created: DateTime<Utc>,
}
