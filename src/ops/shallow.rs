//! local-only commit: the container's newest layer, config and manifest

use tracing::debug;

use crate::builder::Builder;
use crate::digest::Digest;
use crate::error::{Error, Result, StoreResultExt};
use crate::image::{BlobInfo, ImageSource, GZIPPED_EMPTY_LAYER};
use crate::store::{add_image_names, random_id, Rollback, Store, Undo};
use crate::transport::{expand_tags, ImageReference};
use crate::types::Image;

/// suffix of the staging image every shallow commit writes through
pub const TEMPORARY_IMAGE_SUFFIX: &str = "-tmp-imprint-commit";

/// deletes the staging image however the commit ends
struct TemporaryImage<'a> {
    store: &'a dyn Store,
    reference: ImageReference,
}

impl Drop for TemporaryImage<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.reference.delete_image(self.store) {
            debug!(image = %self.reference, error = %e, "error deleting temporary image");
        }
    }
}

/// commit a builder's container into the local store without a full copy.
///
/// the config and manifest from `src` go through a temporary image first; the
/// container's diff becomes one new read-only layer, and the final image only
/// gets its names once everything else is in place.
pub fn shallow_copy(
    store: &dyn Store,
    builder: &Builder,
    dest: &ImageReference,
    src: &dyn ImageSource,
) -> Result<Image> {
    let name = dest.name().ok_or(Error::UnnamedDestination)?;
    let names = expand_tags(&[name.to_string()])?;

    let tmp = TemporaryImage {
        store,
        reference: ImageReference::storage(&format!("{}{}", random_id(), TEMPORARY_IMAGE_SUFFIX)),
    };
    let tmp_name = tmp.reference.to_string();
    let mut tmp_image = tmp.reference.new_image_destination(store)?;

    // images need at least one layer
    tmp_image
        .put_blob(
            &mut &GZIPPED_EMPTY_LAYER[..],
            &BlobInfo::new(
                Digest::of(&GZIPPED_EMPTY_LAYER),
                GZIPPED_EMPTY_LAYER.len() as u64,
            ),
            false,
        )
        .store_op("write empty layer for", &tmp_name)?;

    let config = src.config_blob()?;
    if config.is_empty() {
        return Err(Error::EmptyConfig(dest.to_string()));
    }
    let config_digest = Digest::of(&config);
    debug!(digest = %config_digest, size = config.len(), "read configuration blob");
    tmp_image
        .put_blob(
            &mut config.as_slice(),
            &BlobInfo::new(config_digest, config.len() as u64),
            true,
        )
        .store_op("write image configuration for", &tmp_name)?;

    let (manifest, _) = src.manifest()?;
    tmp_image
        .put_manifest(&manifest)
        .store_op("write manifest for", &tmp_name)?;
    tmp_image.commit().store_op("commit", &tmp_name)?;
    drop(tmp_image);

    let tmp_record = tmp
        .reference
        .resolve_image(store)
        .store_op("locate temporary image", &tmp_name)?;
    let items = store
        .list_image_big_data(&tmp_record.id)
        .store_op("list data items of", &tmp_record.id)?;

    let container_id = builder.container_id()?;
    let container = store
        .container(container_id)
        .store_op("read working container", container_id)?;
    let parent_layer = match &container.image_id {
        Some(image_id) => Some(
            store
                .image(image_id)
                .store_op("read source image of container", container_id)?
                .top_layer,
        ),
        None => None,
    };

    let mut rollback = Rollback::new(store);
    let layer = {
        let mut diff = store
            .diff(parent_layer.as_deref(), &container.layer_id)
            .store_op("read layer of container", container_id)?;
        store
            .create_layer(parent_layer.as_deref(), true, &mut diff)
            .store_op("create read-only layer from container", container_id)?
    };
    rollback.push(Undo::DeleteLayer(layer.id.clone()));

    let image = store
        .create_image(None, &[], &layer.id, "")
        .store_op("create image", dest)?;
    rollback.push(Undo::DeleteImage(image.id.clone()));
    debug!(image = %image.id, layer = %layer.id, "created image");

    for item in &items {
        let data = store
            .image_big_data(&tmp_record.id, item)
            .store_op("copy data item", item)?;
        store
            .set_image_big_data(&image.id, item, &data)
            .store_op("copy data item", item)?;
        debug!(item = %item, image = %image.id, "copied data item");
    }

    store
        .set_metadata(&image.id, "{}")
        .store_op("assign metadata to", &image.id)?;
    let mut image = store.image(&image.id).store_op("read new image", &image.id)?;

    // nothing may fail once the names are bound
    add_image_names(store, &image, &names).map_err(|source| Error::TagBinding {
        names: names.clone(),
        source: Box::new(source),
    })?;
    rollback.disarm();
    image.names = names;

    debug!(image = %image.id, names = ?image.names, "assigned names");
    Ok(image)
}
