use std::path::PathBuf;

use crate::Digest;

/// error type for imprint operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store not found at {0}")]
    NoStore(PathBuf),

    #[error("store already exists at {0}")]
    StoreExists(PathBuf),

    #[error("lock contention on store")]
    LockContention,

    #[error("can't write to an unnamed image")]
    UnnamedDestination,

    #[error("error reading new configuration for image {0}: it's empty")]
    EmptyConfig(String),

    #[error("{op} {id:?}: {source}")]
    Store {
        op: String,
        id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("error building signature policy: {source}")]
    PolicyConstruction {
        #[source]
        source: Box<Error>,
    },

    #[error("error {context}: {source}")]
    SourceView {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("error {context}: {source}")]
    Copy {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("error assigning names {names:?}: {source}")]
    TagBinding {
        names: Vec<String>,
        #[source]
        source: Box<Error>,
    },

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("layer not found: {0}")]
    LayerNotFound(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("builder has no working container")]
    NoContainer,

    #[error("data item {key:?} not found on image {image}")]
    BigDataNotFound { image: String, key: String },

    #[error("id already in use: {0}")]
    DuplicateId(String),

    #[error("name already in use: {0}")]
    NameInUse(String),

    #[error("layer {0} is still referenced")]
    LayerInUse(String),

    #[error("image {0} is used by a container")]
    ImageInUse(String),

    #[error("layer {0} is read-only")]
    LayerReadOnly(String),

    #[error("can only diff layer {to} against its parent, not {from:?}")]
    UnsupportedDiff { from: Option<String>, to: String },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("invalid tag: {0}")]
    InvalidTag(String),

    #[error("unknown manifest type: {0}")]
    InvalidManifestType(String),

    #[error("unknown compression: {0}")]
    InvalidCompression(String),

    #[error("{compression} layers can't be described by a {manifest_type} manifest")]
    UnsupportedCompression {
        manifest_type: String,
        compression: String,
    },

    #[error("signature policy at {path}: {message}")]
    InvalidPolicy { path: PathBuf, message: String },

    #[error("signature policy rejects writing to {0}")]
    PolicyRejected(String),

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("remote not found: {0}")]
    RemoteNotFound(String),

    #[error("remote already exists: {0}")]
    RemoteExists(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

impl Error {
    /// innermost error, following the wrapping variants
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Store { source, .. }
            | Error::PolicyConstruction { source }
            | Error::SourceView { source, .. }
            | Error::Copy { source, .. }
            | Error::TagBinding { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}

/// helper to tag store failures with the operation and object they concern
pub trait StoreResultExt<T> {
    fn store_op(self, op: &str, id: impl std::fmt::Display) -> Result<T>;
}

impl<T> StoreResultExt<T> for Result<T> {
    fn store_op(self, op: &str, id: impl std::fmt::Display) -> Result<T> {
        self.map_err(|source| Error::Store {
            op: op.to_string(),
            id: id.to_string(),
            source: Box::new(source),
        })
    }
}
