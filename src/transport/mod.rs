//! image references and the backends they resolve to

mod dir;
mod storage;
mod tags;

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::image::ImageDestination;
use crate::store::Store;
use crate::types::Image;

pub use dir::{DirDestination, DIR_VERSION};
pub use storage::StoreDestination;
pub use tags::{expand_tag, expand_tags, repository, validate_name, DEFAULT_TAG};

/// backend an image reference points into
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    /// the local object store
    Storage,
    /// a plain directory of blobs
    Dir,
    /// a registry
    Docker,
}

impl Transport {
    pub fn name(self) -> &'static str {
        match self {
            Transport::Storage => "containers-storage",
            Transport::Dir => "dir",
            Transport::Docker => "docker",
        }
    }

    /// does this transport write into the local object store
    pub fn is_local_store(self) -> bool {
        self == Transport::Storage
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// a destination or source bound to a specific transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    transport: Transport,
    name: Option<String>,
    path: Option<PathBuf>,
}

impl ImageReference {
    /// reference into the local store; an empty name gives an unnamed reference
    pub fn storage(name: &str) -> Self {
        Self {
            transport: Transport::Storage,
            name: (!name.is_empty()).then(|| name.to_string()),
            path: None,
        }
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self {
            transport: Transport::Dir,
            name: None,
            path: Some(path.into()),
        }
    }

    pub fn docker(name: &str) -> Self {
        Self {
            transport: Transport::Docker,
            name: Some(name.to_string()),
            path: None,
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// target image name, if the reference carries one
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// open the reference for writing
    pub fn new_image_destination<'a>(
        &self,
        store: &'a dyn Store,
    ) -> Result<Box<dyn ImageDestination + 'a>> {
        match self.transport {
            Transport::Storage => Ok(Box::new(StoreDestination::new(store, self.clone()))),
            Transport::Dir => {
                let path = self
                    .path
                    .as_deref()
                    .ok_or_else(|| Error::InvalidReference(self.to_string()))?;
                Ok(Box::new(DirDestination::new(path)?))
            }
            Transport::Docker => Err(Error::Transport {
                message: format!("writing to registries is not supported: {}", self),
            }),
        }
    }

    /// find the image a local store reference names, trying the name as given
    /// and then with the default tag added
    pub fn resolve_image(&self, store: &dyn Store) -> Result<Image> {
        if !self.transport.is_local_store() {
            return Err(Error::Transport {
                message: format!("{} images can't be resolved locally", self.transport),
            });
        }
        let name = self
            .name()
            .ok_or_else(|| Error::InvalidReference(self.to_string()))?;

        match store.image(name) {
            Err(Error::ImageNotFound(_)) => {}
            other => return other,
        }

        match expand_tag(name) {
            Ok(expanded) if expanded != name => {
                debug!(name, expanded = %expanded, "retrying lookup with default tag");
                store.image(&expanded)
            }
            _ => Err(Error::ImageNotFound(name.to_string())),
        }
    }

    /// delete the image this reference names, along with layers only it used
    pub fn delete_image(&self, store: &dyn Store) -> Result<()> {
        let image = self.resolve_image(store)?;
        store.delete_image(&image.id, true)?;
        Ok(())
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transport {
            Transport::Storage => write!(f, "{}:{}", self.transport, self.name().unwrap_or("")),
            Transport::Dir => write!(
                f,
                "dir:{}",
                self.path.as_deref().unwrap_or(Path::new("")).display()
            ),
            Transport::Docker => write!(f, "docker://{}", self.name().unwrap_or("")),
        }
    }
}

/// parse `containers-storage:NAME`, a bare `NAME`, `dir:PATH` or `docker://NAME`
pub fn parse_reference(s: &str) -> Result<ImageReference> {
    if let Some(name) = s.strip_prefix("containers-storage:") {
        if !name.is_empty() {
            validate_name(name).map_err(|_| Error::InvalidReference(s.to_string()))?;
        }
        return Ok(ImageReference::storage(name));
    }

    if let Some(path) = s.strip_prefix("dir:") {
        if path.is_empty() {
            return Err(Error::InvalidReference(s.to_string()));
        }
        return Ok(ImageReference::dir(path));
    }

    if let Some(name) = s.strip_prefix("docker://") {
        validate_name(name).map_err(|_| Error::InvalidReference(s.to_string()))?;
        return Ok(ImageReference::docker(name));
    }

    // any other scheme-looking prefix is a transport we don't know
    if s.contains("://") || s.starts_with("docker:") {
        return Err(Error::InvalidReference(s.to_string()));
    }

    validate_name(s).map_err(|_| Error::InvalidReference(s.to_string()))?;
    Ok(ImageReference::storage(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FsStore;
    use std::io;
    use tempfile::tempdir;

    #[test]
    fn test_parse_reference_transports() {
        let r = parse_reference("containers-storage:app:1").unwrap();
        assert_eq!(r.transport(), Transport::Storage);
        assert_eq!(r.name(), Some("app:1"));

        let r = parse_reference("app").unwrap();
        assert!(r.transport().is_local_store());
        assert_eq!(r.to_string(), "containers-storage:app");

        let r = parse_reference("dir:/tmp/out").unwrap();
        assert_eq!(r.transport(), Transport::Dir);
        assert_eq!(r.path(), Some(Path::new("/tmp/out")));
        assert_eq!(r.name(), None);

        let r = parse_reference("docker://registry.example/app:1").unwrap();
        assert_eq!(r.transport(), Transport::Docker);
        assert_eq!(r.to_string(), "docker://registry.example/app:1");
    }

    #[test]
    fn test_parse_reference_unnamed_storage() {
        let r = parse_reference("containers-storage:").unwrap();
        assert_eq!(r.name(), None);
    }

    #[test]
    fn test_parse_reference_errors() {
        for s in ["dir:", "oci://x", "docker:app", "Bad Name", "docker://UPPER"] {
            assert!(
                matches!(parse_reference(s), Err(Error::InvalidReference(_))),
                "{:?}",
                s
            );
        }
    }

    #[test]
    fn test_resolve_image_adds_default_tag() {
        let dir = tempdir().unwrap();
        let store = FsStore::init(dir.path()).unwrap();
        let layer = store.create_layer(None, true, &mut io::empty()).unwrap();
        let image = store
            .create_image(None, &["base:latest".to_string()], &layer.id, "")
            .unwrap();

        let resolved = ImageReference::storage("base").resolve_image(&store).unwrap();
        assert_eq!(resolved.id, image.id);

        let resolved = ImageReference::storage(&image.id)
            .resolve_image(&store)
            .unwrap();
        assert_eq!(resolved.id, image.id);

        assert!(matches!(
            ImageReference::storage("other").resolve_image(&store),
            Err(Error::ImageNotFound(_))
        ));
    }

    #[test]
    fn test_delete_image_by_reference() {
        let dir = tempdir().unwrap();
        let store = FsStore::init(dir.path()).unwrap();
        let layer = store.create_layer(None, true, &mut io::empty()).unwrap();
        store
            .create_image(None, &["gone:1".to_string()], &layer.id, "")
            .unwrap();

        ImageReference::storage("gone:1").delete_image(&store).unwrap();

        assert!(store.images().unwrap().is_empty());
        assert!(store.layers().unwrap().is_empty());
    }

    #[test]
    fn test_registry_destination_unsupported() {
        let dir = tempdir().unwrap();
        let store = FsStore::init(dir.path()).unwrap();
        let result = ImageReference::docker("registry.example/app").new_image_destination(&store);
        assert!(matches!(result, Err(Error::Transport { .. })));
    }
}
