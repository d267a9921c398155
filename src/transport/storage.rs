//! writing images into the local object store

use std::io::Read;

use tracing::debug;

use crate::digest::Digest;
use crate::error::{Error, IoResultExt, Result, StoreResultExt};
use crate::image::{BlobInfo, ImageDestination};
use crate::store::{Rollback, Store, Undo};
use crate::transport::{expand_tag, ImageReference};

/// stages blobs in memory and turns them into store objects on commit
pub struct StoreDestination<'a> {
    store: &'a dyn Store,
    reference: ImageReference,
    layers: Vec<Vec<u8>>,
    config: Option<(Digest, Vec<u8>)>,
    manifest: Option<Vec<u8>>,
}

impl<'a> StoreDestination<'a> {
    pub fn new(store: &'a dyn Store, reference: ImageReference) -> Self {
        Self {
            store,
            reference,
            layers: Vec::new(),
            config: None,
            manifest: None,
        }
    }
}

impl ImageDestination for StoreDestination<'_> {
    fn reference(&self) -> ImageReference {
        self.reference.clone()
    }

    fn put_blob(
        &mut self,
        blob: &mut dyn Read,
        info: &BlobInfo,
        is_config: bool,
    ) -> Result<BlobInfo> {
        let mut data = Vec::new();
        blob.read_to_end(&mut data)
            .with_path(self.reference.to_string())?;
        let stored = verify_blob(&data, info)?;

        if is_config {
            self.config = Some((Digest::of(&data), data));
        } else {
            self.layers.push(data);
        }
        Ok(stored)
    }

    fn put_manifest(&mut self, manifest: &[u8]) -> Result<()> {
        self.manifest = Some(manifest.to_vec());
        Ok(())
    }

    /// layers (chained, in order), then the image, its data items, metadata,
    /// and the name last
    fn commit(&mut self) -> Result<()> {
        let store = self.store;
        let reference = self.reference.to_string();
        let manifest = self.manifest.take().ok_or_else(|| Error::Transport {
            message: format!("no manifest written to {}", reference),
        })?;

        let mut rollback = Rollback::new(store);

        let mut parent: Option<String> = None;
        for blob in &self.layers {
            let layer = store
                .create_layer(parent.as_deref(), true, &mut blob.as_slice())
                .store_op("create layer for", &reference)?;
            rollback.push(Undo::DeleteLayer(layer.id.clone()));
            parent = Some(layer.id);
        }
        let top_layer = parent.ok_or_else(|| Error::Transport {
            message: format!("no layers written to {}", reference),
        })?;

        let image = store
            .create_image(None, &[], &top_layer, "")
            .store_op("create image", &reference)?;
        rollback.push(Undo::DeleteImage(image.id.clone()));

        if let Some((digest, data)) = &self.config {
            store
                .set_image_big_data(&image.id, &digest.to_string(), data)
                .store_op("save configuration for", &image.id)?;
        }
        store
            .set_image_big_data(&image.id, "manifest", &manifest)
            .store_op("save manifest for", &image.id)?;
        store
            .set_image_big_data(
                &image.id,
                &format!("manifest-{}", Digest::of(&manifest)),
                &manifest,
            )
            .store_op("save manifest for", &image.id)?;
        store
            .set_metadata(&image.id, "{}")
            .store_op("set metadata for", &image.id)?;

        if let Some(name) = self.reference.name() {
            let names = vec![expand_tag(name)?];
            store
                .set_names(&image.id, &names)
                .store_op("set names for", &image.id)?;
        }

        rollback.disarm();
        self.layers.clear();
        self.config = None;
        debug!(image = %image.id, reference = %reference, "committed image");
        Ok(())
    }
}

/// check a blob against what the caller claimed about it
pub(crate) fn verify_blob(data: &[u8], info: &BlobInfo) -> Result<BlobInfo> {
    let digest = Digest::of(data);
    if let Some(expected) = info.digest {
        if expected != digest {
            return Err(Error::DigestMismatch {
                expected,
                actual: digest,
            });
        }
    }
    if let Some(size) = info.size {
        if size != data.len() as u64 {
            return Err(Error::Transport {
                message: format!(
                    "blob {} is {} bytes, expected {}",
                    digest,
                    data.len(),
                    size
                ),
            });
        }
    }

    Ok(BlobInfo {
        digest: Some(digest),
        size: Some(data.len() as u64),
        media_type: info.media_type.clone(),
    })
}
