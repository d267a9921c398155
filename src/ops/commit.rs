//! commit a working container to a destination

use std::fmt;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::builder::Builder;
use crate::compression::Compression;
use crate::copy::CopyOptions;
use crate::error::{Error, Result, StoreResultExt};
use crate::image::ViewOptions;
use crate::ops::engine::{copy_error, policy_error, source_view_error, Engine};
use crate::ops::shallow::shallow_copy;
use crate::store::add_image_names;
use crate::transport::{expand_tags, ImageReference};
use crate::types::ManifestType;

/// commit options
#[derive(Default)]
pub struct CommitOptions {
    /// manifest schema for the new image
    pub manifest_type: ManifestType,
    /// compression for exported layer blobs
    pub compression: Compression,
    /// policy used instead of the system-wide one
    pub signature_policy_path: Option<PathBuf>,
    /// extra names for the new image (local store only)
    pub additional_tags: Vec<String>,
    /// receives copy progress
    pub report_writer: Option<Box<dyn Write + Send>>,
    /// timestamp for the new history entry; defaults to now
    pub history_timestamp: Option<DateTime<Utc>>,
}

impl fmt::Debug for CommitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitOptions")
            .field("manifest_type", &self.manifest_type)
            .field("compression", &self.compression)
            .field("signature_policy_path", &self.signature_policy_path)
            .field("additional_tags", &self.additional_tags)
            .field("report_writer", &self.report_writer.is_some())
            .field("history_timestamp", &self.history_timestamp)
            .finish()
    }
}

/// which way a commit was written
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitPath {
    /// straight into the local store
    Shallow,
    /// through the copier
    Export,
}

/// commit result
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitReport {
    pub path: CommitPath,
    /// new image id, for local destinations
    pub image_id: Option<String>,
}

impl Engine<'_> {
    /// write the builder's container and configuration to `dest`, then add any
    /// additional tags if the destination supports them
    pub fn commit(
        &self,
        builder: &Builder,
        dest: &ImageReference,
        options: CommitOptions,
    ) -> Result<CommitReport> {
        let CommitOptions {
            manifest_type,
            compression,
            signature_policy_path,
            additional_tags,
            report_writer,
            history_timestamp,
        } = options;

        let policy = self
            .policy
            .default_policy(signature_policy_path.as_deref())
            .map_err(policy_error)?;
        let policy_context = self.policy.new_context(policy).map_err(policy_error)?;

        // local storage gets the shortcut
        let local = dest.transport().is_local_store();
        let view_options = ViewOptions {
            manifest_type,
            exporting: !local,
            compression,
            history_timestamp,
        };
        let src = self
            .views
            .container_view(self.store, builder, &view_options)
            .map_err(source_view_error(
                "computing layer digests and building metadata",
            ))?;

        let report = if local {
            let image = shallow_copy(self.store, builder, dest, src.as_ref())
                .map_err(copy_error("copying layer and metadata"))?;
            CommitReport {
                path: CommitPath::Shallow,
                image_id: Some(image.id),
            }
        } else {
            let mut copy_options = CopyOptions {
                report_writer,
                compression,
            };
            self.copier
                .copy(self.store, &policy_context, dest, src.as_ref(), &mut copy_options)
                .map_err(copy_error("copying layers and metadata"))?;
            CommitReport {
                path: CommitPath::Export,
                image_id: None,
            }
        };
        debug!(dest = %dest, path = ?report.path, "committed");

        if !additional_tags.is_empty() {
            if local {
                // by id: the name may already belong to a newer commit
                let id = report
                    .image_id
                    .as_deref()
                    .ok_or_else(|| Error::ImageNotFound(dest.to_string()))?;
                let image = self
                    .store
                    .image(id)
                    .store_op("locate just-written image", id)?;
                let tag_error = |source: Error| Error::TagBinding {
                    names: additional_tags.clone(),
                    source: Box::new(source),
                };
                let names = expand_tags(&additional_tags).map_err(tag_error)?;
                add_image_names(self.store, &image, &names).map_err(tag_error)?;
                debug!(image = %image.id, names = ?names, "assigned additional names");
            } else {
                warn!(
                    transport = %dest.transport(),
                    "don't know how to add tags to images stored in this transport"
                );
            }
        }

        Ok(report)
    }
}
