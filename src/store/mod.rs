//! content-addressed object store holding layers, images and containers

mod fs;
mod rollback;

use std::io::Read;

pub use fs::{FsStore, StoreLock};
pub use rollback::{Rollback, Undo};

use crate::error::{Error, Result};
use crate::types::{Container, Image, Layer};

/// backend that owns layers, images, their data items and names.
///
/// implementations provide their own concurrency control; callers never lock.
/// there is no multi-object transaction: callers that need one compose
/// create/delete pairs themselves.
pub trait Store {
    /// create a layer from a diff stream (compressed diffs are unpacked)
    fn create_layer(&self, parent: Option<&str>, read_only: bool, diff: &mut dyn Read)
        -> Result<Layer>;

    fn layer(&self, id: &str) -> Result<Layer>;

    fn layers(&self) -> Result<Vec<Layer>>;

    /// replace the contents of a writable layer
    fn set_layer_diff(&self, id: &str, diff: &mut dyn Read) -> Result<Layer>;

    /// delete a layer nothing references
    fn delete_layer(&self, id: &str) -> Result<()>;

    /// stream the changes between `from` and `to`
    fn diff(&self, from: Option<&str>, to: &str) -> Result<Box<dyn Read + Send>>;

    /// create an image record on top of an existing layer
    fn create_image(
        &self,
        id: Option<&str>,
        names: &[String],
        top_layer: &str,
        metadata: &str,
    ) -> Result<Image>;

    /// look up an image by id or by one of its names
    fn image(&self, id_or_name: &str) -> Result<Image>;

    fn images(&self) -> Result<Vec<Image>>;

    /// delete an image, optionally along with layers only it used.
    /// returns the ids of the deleted layers
    fn delete_image(&self, id: &str, delete_layers: bool) -> Result<Vec<String>>;

    fn list_image_big_data(&self, id: &str) -> Result<Vec<String>>;

    fn image_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>>;

    fn set_image_big_data(&self, id: &str, key: &str, data: &[u8]) -> Result<()>;

    fn set_metadata(&self, id: &str, metadata: &str) -> Result<()>;

    /// replace an image's names; the names are removed from any other image
    fn set_names(&self, id: &str, names: &[String]) -> Result<()>;

    /// create a container with a fresh writable layer on top of `image`
    fn create_container(
        &self,
        id: Option<&str>,
        names: &[String],
        image: Option<&str>,
        metadata: &str,
    ) -> Result<Container>;

    fn container(&self, id_or_name: &str) -> Result<Container>;

    fn containers(&self) -> Result<Vec<Container>>;

    fn set_container_metadata(&self, id: &str, metadata: &str) -> Result<()>;

    /// delete a container and its writable layer
    fn delete_container(&self, id: &str) -> Result<()>;
}

/// generate a random 64 hex character identifier
pub fn random_id() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// add names to an image, keeping the ones it already has
pub fn add_image_names(store: &dyn Store, image: &Image, names: &[String]) -> Result<()> {
    let mut all = image.names.clone();
    for name in names {
        if !all.contains(name) {
            all.push(name.clone());
        }
    }
    store.set_names(&image.id, &all)
}

/// images with at least one name matching a glob pattern
pub fn images_matching(store: &dyn Store, pattern: &str) -> Result<Vec<Image>> {
    let glob = glob::Pattern::new(pattern).map_err(|e| Error::InvalidTag(e.to_string()))?;
    Ok(store
        .images()?
        .into_iter()
        .filter(|i| i.names.iter().any(|n| glob.matches(n)))
        .collect())
}
