//! push a stored image to another destination

use std::fmt;
use std::io::Write;
use std::path::PathBuf;

use tracing::debug;

use crate::builder::Builder;
use crate::compression::Compression;
use crate::copy::CopyOptions;
use crate::error::{Error, Result, StoreResultExt};
use crate::ops::engine::{copy_error, policy_error, source_view_error, Engine};
use crate::transport::{parse_reference, ImageReference};
use crate::types::ManifestType;

/// push options
#[derive(Default)]
pub struct PushOptions {
    /// compression for layer blobs
    pub compression: Compression,
    pub manifest_type: ManifestType,
    /// policy used instead of the system-wide one
    pub signature_policy_path: Option<PathBuf>,
    /// receives copy progress
    pub report_writer: Option<Box<dyn Write + Send>>,
}

impl fmt::Debug for PushOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushOptions")
            .field("compression", &self.compression)
            .field("manifest_type", &self.manifest_type)
            .field("signature_policy_path", &self.signature_policy_path)
            .field("report_writer", &self.report_writer.is_some())
            .finish()
    }
}

impl Engine<'_> {
    /// copy a stored image to `dest`, rebuilding its config and manifest from
    /// what the store holds. the image's existing layer chain is exported as is
    pub fn push(&self, image: &str, dest: &ImageReference, options: PushOptions) -> Result<()> {
        let PushOptions {
            compression,
            manifest_type,
            signature_policy_path,
            report_writer,
        } = options;

        let policy = self
            .policy
            .default_policy(signature_policy_path.as_deref())
            .map_err(policy_error)?;
        let policy_context = self.policy.new_context(policy).map_err(policy_error)?;

        let mut builder = Builder::import_from_image(self.store, image)
            .map_err(source_view_error("importing builder information from image"))?;

        let reference = parse_reference(image).store_op("parse reference to image", image)?;
        if !reference.transport().is_local_store() {
            return Err(Error::InvalidReference(image.to_string()))
                .store_op("parse reference to image", image);
        }
        let stored = reference
            .resolve_image(self.store)
            .store_op("locate image", image)?;

        // the pushed image keeps its source's ancestry
        builder.from_image = builder.container_config_image.clone();
        builder.from_image_id = builder.parent.clone();

        let src = self
            .views
            .image_view(
                self.store,
                &builder,
                &stored.names,
                &stored.top_layer,
                compression,
                manifest_type,
            )
            .map_err(source_view_error(
                "recomputing layer digests and building metadata",
            ))?;

        let mut copy_options = CopyOptions {
            report_writer,
            compression,
        };
        self.copier
            .copy(self.store, &policy_context, dest, src.as_ref(), &mut copy_options)
            .map_err(copy_error("copying layers and metadata"))?;

        debug!(image = %stored.id, dest = %dest, "pushed image");
        Ok(())
    }
}
