//! writing images as a plain directory of blobs

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{IoResultExt, Result};
use crate::image::{BlobInfo, ImageDestination};
use crate::transport::storage::verify_blob;
use crate::transport::ImageReference;

pub const DIR_VERSION: &str = "Directory Transport Version: 1.1\n";

/// `<dir>/<hex digest>` per blob, plus `manifest.json` and `version`
pub struct DirDestination {
    path: PathBuf,
}

impl DirDestination {
    pub fn new(path: &Path) -> Result<Self> {
        fs::create_dir_all(path).with_path(path)?;
        let dest = Self {
            path: path.to_path_buf(),
        };
        dest.write_file("version", DIR_VERSION.as_bytes())?;
        Ok(dest)
    }

    /// temp file in the target dir, then rename
    fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        let tmp_path = self
            .path
            .join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        {
            let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
            tmp_file.write_all(data).with_path(&tmp_path)?;
            tmp_file.sync_all().with_path(&tmp_path)?;
        }

        let path = self.path.join(name);
        fs::rename(&tmp_path, &path).with_path(&path)?;
        Ok(())
    }
}

impl ImageDestination for DirDestination {
    fn reference(&self) -> ImageReference {
        ImageReference::dir(&self.path)
    }

    fn put_blob(
        &mut self,
        blob: &mut dyn Read,
        info: &BlobInfo,
        _is_config: bool,
    ) -> Result<BlobInfo> {
        let mut data = Vec::new();
        blob.read_to_end(&mut data).with_path(&self.path)?;
        let stored = verify_blob(&data, info)?;

        if let Some(digest) = stored.digest {
            self.write_file(&digest.to_hex(), &data)?;
            debug!(path = %self.path.display(), blob = %digest, "wrote blob");
        }
        Ok(stored)
    }

    fn put_manifest(&mut self, manifest: &[u8]) -> Result<()> {
        self.write_file("manifest.json", manifest)
    }

    fn commit(&mut self) -> Result<()> {
        let dir = File::open(&self.path).with_path(&self.path)?;
        dir.sync_all().with_path(&self.path)?;
        Ok(())
    }
}
