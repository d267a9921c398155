//! working container state accumulated before a commit

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result, StoreResultExt};
use crate::store::Store;
use crate::transport::ImageReference;
use crate::types::{ContainerConfig, History, ImageConfig, Manifest};

/// base name that starts a builder without an image
pub const SCRATCH: &str = "scratch";

/// a working container plus the image configuration it will be committed with.
///
/// persisted as the container's metadata so separate invocations can keep
/// editing the same builder.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Builder {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// name of the image the container started from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_image_id: Option<String>,
    #[serde(default)]
    pub config: ContainerConfig,
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// history text recorded for the next commit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
    /// parent declared by an imported image config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// `container_config.Image` of an imported image config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_config_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl Builder {
    /// start a working container from an image, or from nothing for `scratch`
    pub fn new(store: &dyn Store, from: &str) -> Result<Self> {
        let mut builder = if from == SCRATCH {
            Builder {
                architecture: default_architecture().to_string(),
                os: std::env::consts::OS.to_string(),
                ..Default::default()
            }
        } else {
            let image = ImageReference::storage(from)
                .resolve_image(store)
                .store_op("locate image", from)?;
            let mut builder = Self::import_from_image(store, &image.id)?;
            builder.from_image = Some(from.to_string());
            builder.from_image_id = Some(image.id);
            builder
        };

        let container = store
            .create_container(None, &[], builder.from_image_id.as_deref(), "")
            .store_op("create container from", from)?;
        builder.container_id = Some(container.id);
        builder.save(store)?;

        debug!(container = ?builder.container_id, from, "created builder");
        Ok(builder)
    }

    /// load the builder saved on a container
    pub fn load(store: &dyn Store, container: &str) -> Result<Self> {
        let container = store
            .container(container)
            .store_op("locate container", container)?;
        let mut builder: Builder = serde_json::from_str(&container.metadata)?;
        builder.container_id = Some(container.id);
        Ok(builder)
    }

    /// persist onto the container's metadata
    pub fn save(&self, store: &dyn Store) -> Result<()> {
        let id = self.container_id()?;
        let metadata = serde_json::to_string(self)?;
        store
            .set_container_metadata(id, &metadata)
            .store_op("save builder for container", id)
    }

    pub fn container_id(&self) -> Result<&str> {
        self.container_id.as_deref().ok_or(Error::NoContainer)
    }

    /// build a builder from the configuration stored with an image
    pub fn import_from_image(store: &dyn Store, image: &str) -> Result<Self> {
        let image = ImageReference::storage(image)
            .resolve_image(store)
            .store_op("locate image", image)?;

        let key = config_key(store, &image.id)?;
        let data = store
            .image_big_data(&image.id, &key)
            .store_op("read configuration of", &image.id)?;
        if data.is_empty() {
            return Err(Error::EmptyConfig(image.id));
        }
        let config: ImageConfig = serde_json::from_slice(&data)?;

        Ok(Builder {
            container_id: None,
            from_image: None,
            from_image_id: None,
            config: config.config,
            architecture: config.architecture,
            os: config.os,
            author: config.author,
            created_by: None,
            history: config.history,
            parent: config.parent,
            container_config_image: config.container_config.and_then(|c| c.image),
            created: config.created,
        })
    }
}

/// the data item holding an image's configuration: the one the manifest points
/// at, or failing that the first digest-keyed item
fn config_key(store: &dyn Store, image_id: &str) -> Result<String> {
    if let Ok(manifest) = store.image_big_data(image_id, "manifest") {
        if let Ok(manifest) = Manifest::from_slice(&manifest) {
            return Ok(manifest.config.digest.to_string());
        }
    }

    store
        .list_image_big_data(image_id)
        .store_op("list data items of", image_id)?
        .into_iter()
        .find(|k| k.starts_with("sha256:"))
        .ok_or_else(|| Error::BigDataNotFound {
            image: image_id.to_string(),
            key: "sha256:*".to_string(),
        })
}

/// go-style architecture name for the running platform
pub fn default_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}
