//! image sources and destinations moved around by commit and push

mod source;

use std::io::Read;

use crate::digest::Digest;
use crate::error::Result;
use crate::transport::ImageReference;

pub use source::{ContainerImageRef, SourceViewBuilder, StoreViewBuilder, ViewOptions};

/// a gzip stream that decompresses to [`EMPTY_LAYER_SIZE`] zero bytes, the
/// tar end-of-archive marker. images always carry at least this layer.
pub const GZIPPED_EMPTY_LAYER: [u8; 32] = [
    0x1f, 0x8b, 0x08, 0x00, 0x00, 0x09, 0x6e, 0x88, 0x00, 0xff, 0x62, 0x18, 0x05, 0xa3, 0x60, 0x14,
    0x8c, 0x58, 0x00, 0x08, 0x00, 0x00, 0xff, 0xff, 0x2e, 0xaf, 0xb5, 0xef, 0x00, 0x04, 0x00, 0x00,
];

pub const EMPTY_LAYER_SIZE: usize = 1024;

/// what a caller knows about a blob it hands over
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlobInfo {
    pub digest: Option<Digest>,
    pub size: Option<u64>,
    pub media_type: Option<String>,
}

impl BlobInfo {
    pub fn new(digest: Digest, size: u64) -> Self {
        Self {
            digest: Some(digest),
            size: Some(size),
            media_type: None,
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }
}

/// a readable view of an image
pub trait ImageSource {
    fn reference(&self) -> ImageReference;

    /// the image configuration blob
    fn config_blob(&self) -> Result<Vec<u8>>;

    /// the manifest and its media type
    fn manifest(&self) -> Result<(Vec<u8>, String)>;

    fn get_blob(&self, digest: &Digest) -> Result<Box<dyn Read + '_>>;
}

/// a writable image, visible to readers only after `commit`
pub trait ImageDestination {
    fn reference(&self) -> ImageReference;

    /// store a blob, verifying any digest and size given in `info`.
    /// `is_config` marks the image configuration
    fn put_blob(&mut self, blob: &mut dyn Read, info: &BlobInfo, is_config: bool)
        -> Result<BlobInfo>;

    fn put_manifest(&mut self, manifest: &[u8]) -> Result<()>;

    fn commit(&mut self) -> Result<()>;
}
