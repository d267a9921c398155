//! source views computed from store state

use std::collections::HashMap;
use std::io::Read;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::builder::Builder;
use crate::compression::Compression;
use crate::digest::Digest;
use crate::error::{Error, IoResultExt, Result, StoreResultExt};
use crate::image::{ImageSource, EMPTY_LAYER_SIZE, GZIPPED_EMPTY_LAYER};
use crate::store::Store;
use crate::transport::ImageReference;
use crate::types::{
    ContainerConfig, Descriptor, History, ImageConfig, Layer, Manifest, ManifestType, RootFs,
};

/// how a container view is computed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ViewOptions {
    pub manifest_type: ManifestType,
    /// include every layer in the chain, rather than only the empty placeholder
    pub exporting: bool,
    pub compression: Compression,
    /// timestamp for the new history entry; defaults to now
    pub history_timestamp: Option<DateTime<Utc>>,
}

/// computes the config, manifest and layer blobs an image is exported with
pub trait SourceViewBuilder {
    /// view of a working container as it would be committed
    fn container_view(
        &self,
        store: &dyn Store,
        builder: &Builder,
        options: &ViewOptions,
    ) -> Result<Box<dyn ImageSource>>;

    /// view of an already stored image, reusing its layer chain
    fn image_view(
        &self,
        store: &dyn Store,
        builder: &Builder,
        names: &[String],
        top_layer: &str,
        compression: Compression,
        manifest_type: ManifestType,
    ) -> Result<Box<dyn ImageSource>>;
}

impl<T: SourceViewBuilder + ?Sized> SourceViewBuilder for &T {
    fn container_view(
        &self,
        store: &dyn Store,
        builder: &Builder,
        options: &ViewOptions,
    ) -> Result<Box<dyn ImageSource>> {
        (**self).container_view(store, builder, options)
    }

    fn image_view(
        &self,
        store: &dyn Store,
        builder: &Builder,
        names: &[String],
        top_layer: &str,
        compression: Compression,
        manifest_type: ManifestType,
    ) -> Result<Box<dyn ImageSource>> {
        (**self).image_view(store, builder, names, top_layer, compression, manifest_type)
    }
}

/// builds views straight from the object store
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreViewBuilder;

impl SourceViewBuilder for StoreViewBuilder {
    fn container_view(
        &self,
        store: &dyn Store,
        builder: &Builder,
        options: &ViewOptions,
    ) -> Result<Box<dyn ImageSource>> {
        let container_id = builder.container_id()?;
        let container = store
            .container(container_id)
            .store_op("locate container", container_id)?;

        let layers = if options.exporting {
            layer_chain(store, &container.layer_id)?
        } else {
            Vec::new()
        };

        let created = options.history_timestamp.unwrap_or_else(Utc::now);
        let mut history = builder.history.clone();
        history.push(History {
            created: Some(created),
            created_by: builder.created_by.clone(),
            author: builder.author.clone(),
            comment: None,
            empty_layer: false,
        });

        let view = ContainerImageRef::compute(
            store,
            builder,
            ImageReference::storage(container_id),
            &layers,
            history,
            Some(created),
            options.manifest_type,
            options.compression,
        )?;
        debug!(container = %container_id, layers = layers.len(), "computed container view");
        Ok(Box::new(view))
    }

    fn image_view(
        &self,
        store: &dyn Store,
        builder: &Builder,
        names: &[String],
        top_layer: &str,
        compression: Compression,
        manifest_type: ManifestType,
    ) -> Result<Box<dyn ImageSource>> {
        let layers = layer_chain(store, top_layer)?;
        let name = names.first().map(String::as_str).unwrap_or(top_layer);

        let view = ContainerImageRef::compute(
            store,
            builder,
            ImageReference::storage(name),
            &layers,
            builder.history.clone(),
            builder.created,
            manifest_type,
            compression,
        )?;
        debug!(image = %name, layers = layers.len(), "computed image view");
        Ok(Box::new(view))
    }
}

/// an image computed up front: config, manifest, and every blob it references
#[derive(Clone, Debug)]
pub struct ContainerImageRef {
    reference: ImageReference,
    config: Vec<u8>,
    manifest: Vec<u8>,
    manifest_type: ManifestType,
    blobs: HashMap<Digest, Vec<u8>>,
}

impl ContainerImageRef {
    #[allow(clippy::too_many_arguments)]
    fn compute(
        store: &dyn Store,
        builder: &Builder,
        reference: ImageReference,
        layers: &[Layer],
        history: Vec<History>,
        created: Option<DateTime<Utc>>,
        manifest_type: ManifestType,
        compression: Compression,
    ) -> Result<Self> {
        let mut blobs = HashMap::new();
        let mut descriptors = Vec::new();
        let mut diff_ids = Vec::new();

        if layers.is_empty() {
            // nothing exported: describe the image with the empty layer alone
            let media_type = manifest_type.layer_media_type(Compression::Gzip)?;
            let digest = Digest::of(&GZIPPED_EMPTY_LAYER);
            descriptors.push(Descriptor {
                media_type: media_type.to_string(),
                digest,
                size: GZIPPED_EMPTY_LAYER.len() as u64,
            });
            diff_ids.push(Digest::of(&[0u8; EMPTY_LAYER_SIZE]));
            blobs.insert(digest, GZIPPED_EMPTY_LAYER.to_vec());
        }

        let media_type = manifest_type.layer_media_type(compression)?;
        for layer in layers {
            let mut raw = Vec::new();
            store
                .diff(layer.parent.as_deref(), &layer.id)
                .store_op("read diff of layer", &layer.id)?
                .read_to_end(&mut raw)
                .with_path(format!("layer {}", layer.id))?;

            diff_ids.push(Digest::of(&raw));
            let blob = compression.compress(&raw)?;
            let digest = Digest::of(&blob);
            descriptors.push(Descriptor {
                media_type: media_type.to_string(),
                digest,
                size: blob.len() as u64,
            });
            blobs.insert(digest, blob);
        }

        let image_config = ImageConfig {
            created,
            author: builder.author.clone(),
            architecture: builder.architecture.clone(),
            os: builder.os.clone(),
            config: builder.config.clone(),
            rootfs: RootFs::layers(diff_ids),
            history,
            parent: builder.from_image_id.clone(),
            container_config: Some(ContainerConfig {
                image: builder.from_image.clone(),
                ..builder.config.clone()
            }),
        };
        let config = serde_json::to_vec(&image_config)?;

        let config_descriptor = Descriptor {
            media_type: manifest_type.config_media_type().to_string(),
            digest: Digest::of(&config),
            size: config.len() as u64,
        };
        let manifest = Manifest::new(manifest_type, config_descriptor, descriptors).to_vec()?;

        Ok(Self {
            reference,
            config,
            manifest,
            manifest_type,
            blobs,
        })
    }
}

impl ImageSource for ContainerImageRef {
    fn reference(&self) -> ImageReference {
        self.reference.clone()
    }

    fn config_blob(&self) -> Result<Vec<u8>> {
        Ok(self.config.clone())
    }

    fn manifest(&self) -> Result<(Vec<u8>, String)> {
        Ok((
            self.manifest.clone(),
            self.manifest_type.manifest_media_type().to_string(),
        ))
    }

    fn get_blob(&self, digest: &Digest) -> Result<Box<dyn Read + '_>> {
        if *digest == Digest::of(&self.config) {
            return Ok(Box::new(self.config.as_slice()));
        }
        let blob = self.blobs.get(digest).ok_or_else(|| Error::Transport {
            message: format!("blob {} not found in {}", digest, self.reference),
        })?;
        Ok(Box::new(blob.as_slice()))
    }
}

/// layers from the base up to `top`
fn layer_chain(store: &dyn Store, top: &str) -> Result<Vec<Layer>> {
    let mut chain = Vec::new();
    let mut next = Some(top.to_string());
    while let Some(id) = next {
        let layer = store.layer(&id).store_op("locate layer", &id)?;
        next = layer.parent.clone();
        chain.push(layer);
    }
    chain.reverse();
    Ok(chain)
}
