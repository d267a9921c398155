//! copying an image source into a destination

use std::fmt;
use std::io::{Read, Write};

use tracing::debug;

use crate::compression::Compression;
use crate::digest::Digest;
use crate::error::{IoResultExt, Result};
use crate::image::{BlobInfo, ImageSource};
use crate::policy::PolicyContext;
use crate::store::Store;
use crate::transport::ImageReference;
use crate::types::{Manifest, ManifestType};

/// options for a single copy
#[derive(Default)]
pub struct CopyOptions {
    /// receives one progress line per step
    pub report_writer: Option<Box<dyn Write + Send>>,
    /// compression for layer blobs that arrive uncompressed
    pub compression: Compression,
}

impl fmt::Debug for CopyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyOptions")
            .field("report_writer", &self.report_writer.is_some())
            .field("compression", &self.compression)
            .finish()
    }
}

impl CopyOptions {
    fn report(&mut self, line: fmt::Arguments<'_>) {
        if let Some(writer) = self.report_writer.as_mut() {
            if let Err(e) = writeln!(writer, "{}", line) {
                debug!(error = %e, "failed to write progress report");
            }
        }
    }
}

/// generic image copy: layers, config, manifest, then commit
pub trait ImageCopier {
    fn copy(
        &self,
        store: &dyn Store,
        policy: &PolicyContext,
        dest: &ImageReference,
        src: &dyn ImageSource,
        options: &mut CopyOptions,
    ) -> Result<()>;
}

impl<T: ImageCopier + ?Sized> ImageCopier for &T {
    fn copy(
        &self,
        store: &dyn Store,
        policy: &PolicyContext,
        dest: &ImageReference,
        src: &dyn ImageSource,
        options: &mut CopyOptions,
    ) -> Result<()> {
        (**self).copy(store, policy, dest, src, options)
    }
}

/// copies through whatever destination the reference opens
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicCopier;

impl ImageCopier for BasicCopier {
    fn copy(
        &self,
        store: &dyn Store,
        policy: &PolicyContext,
        dest: &ImageReference,
        src: &dyn ImageSource,
        options: &mut CopyOptions,
    ) -> Result<()> {
        policy.check(&src.reference())?;

        let mut destination = dest.new_image_destination(store)?;
        let (manifest_bytes, manifest_media_type) = src.manifest()?;
        let mut manifest = Manifest::from_slice(&manifest_bytes)?;
        let manifest_type: ManifestType = manifest_media_type.parse()?;
        let mut rewritten = false;

        for descriptor in manifest.layers.iter_mut() {
            let mut blob = Vec::new();
            src.get_blob(&descriptor.digest)?
                .read_to_end(&mut blob)
                .with_path(src.reference().to_string())?;

            if options.compression != Compression::Uncompressed
                && Compression::detect(&blob) == Compression::Uncompressed
            {
                blob = options.compression.compress(&blob)?;
                descriptor.media_type = manifest_type
                    .layer_media_type(options.compression)?
                    .to_string();
                descriptor.digest = Digest::of(&blob);
                descriptor.size = blob.len() as u64;
                rewritten = true;
            }

            options.report(format_args!("Copying blob {}", descriptor.digest));
            let info = BlobInfo::new(descriptor.digest, descriptor.size)
                .with_media_type(descriptor.media_type.clone());
            destination.put_blob(&mut blob.as_slice(), &info, false)?;
        }

        let config = src.config_blob()?;
        options.report(format_args!("Copying config {}", manifest.config.digest));
        let info = BlobInfo::new(manifest.config.digest, manifest.config.size)
            .with_media_type(manifest.config.media_type.clone());
        destination.put_blob(&mut config.as_slice(), &info, true)?;

        let manifest_bytes = if rewritten {
            manifest.to_vec()?
        } else {
            manifest_bytes
        };
        options.report(format_args!("Writing manifest to image destination"));
        destination.put_manifest(&manifest_bytes)?;
        destination.commit()?;
        options.report(format_args!("Storing signatures"));

        debug!(src = %src.reference(), dest = %dest, "copied image");
        Ok(())
    }
}
