use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use nix::fcntl::{Flock, FlockArg};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::compression::Compression;
use crate::config::Config;
use crate::digest::{Digest, Digester};
use crate::error::{Error, IoResultExt, Result};
use crate::store::{random_id, Store};
use crate::types::{BigDataInfo, Container, Image, Layer};

/// a directory-backed store
///
/// layout:
///   config.toml
///   layers/<id>.json, layers/<id>.diff
///   images/<id>/image.json, images/<id>/big-data/<hex(key)>
///   containers/<id>.json
///   tmp/
///
/// every record is written temp -> fsync -> rename, and every mutation
/// holds an exclusive flock on `.lock`.
pub struct FsStore {
    path: PathBuf,
    config: Config,
    #[cfg(test)]
    fail_writes_to: std::sync::Mutex<Option<PathBuf>>,
}

impl FsStore {
    /// initialize a new store at the given path
    pub fn init(path: &Path) -> Result<Self> {
        let config_path = path.join("config.toml");
        if config_path.exists() {
            return Err(Error::StoreExists(path.to_path_buf()));
        }

        // create directory structure
        fs::create_dir_all(path.join("layers")).with_path(path)?;
        fs::create_dir_all(path.join("images")).with_path(path)?;
        fs::create_dir_all(path.join("containers")).with_path(path)?;
        fs::create_dir_all(path.join("tmp")).with_path(path)?;

        let config = Config::default();
        config.save(&config_path)?;

        Ok(Self {
            path: path.to_path_buf(),
            config,
            #[cfg(test)]
            fail_writes_to: Default::default(),
        })
    }

    /// open an existing store
    pub fn open(path: &Path) -> Result<Self> {
        let config_path = path.join("config.toml");
        if !config_path.exists() {
            return Err(Error::NoStore(path.to_path_buf()));
        }

        let config = Config::load(&config_path)?;

        Ok(Self {
            path: path.to_path_buf(),
            config,
            #[cfg(test)]
            fail_writes_to: Default::default(),
        })
    }

    /// store root path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// store configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// mutable access to configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// save configuration changes
    pub fn save_config(&self) -> Result<()> {
        self.config.save(&self.config_path())
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join("config.toml")
    }

    pub fn layers_path(&self) -> PathBuf {
        self.path.join("layers")
    }

    pub fn images_path(&self) -> PathBuf {
        self.path.join("images")
    }

    pub fn containers_path(&self) -> PathBuf {
        self.path.join("containers")
    }

    /// path to tmp directory (for atomic writes)
    pub fn tmp_path(&self) -> PathBuf {
        self.path.join("tmp")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.path.join(".lock")
    }

    /// acquire the exclusive store lock, waiting for other writers.
    /// the lock is released when the guard is dropped
    pub fn lock(&self) -> Result<StoreLock> {
        let lock_path = self.lock_path();
        let file = File::create(&lock_path).with_path(&lock_path)?;

        let flock =
            Flock::lock(file, FlockArg::LockExclusive).map_err(|_| Error::LockContention)?;

        Ok(StoreLock { flock })
    }

    /// try to acquire the lock, returning None if another writer holds it
    pub fn try_lock(&self) -> Result<Option<StoreLock>> {
        let lock_path = self.lock_path();
        let file = File::create(&lock_path).with_path(&lock_path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(StoreLock { flock })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err(_) => Err(Error::LockContention),
        }
    }

    fn layer_record_path(&self, id: &str) -> PathBuf {
        self.layers_path().join(format!("{}.json", id))
    }

    fn layer_diff_path(&self, id: &str) -> PathBuf {
        self.layers_path().join(format!("{}.diff", id))
    }

    fn image_dir(&self, id: &str) -> PathBuf {
        self.images_path().join(id)
    }

    fn image_record_path(&self, id: &str) -> PathBuf {
        self.image_dir(id).join("image.json")
    }

    fn big_data_path(&self, id: &str, key: &str) -> PathBuf {
        self.image_dir(id).join("big-data").join(hex::encode(key))
    }

    fn container_record_path(&self, id: &str) -> PathBuf {
        self.containers_path().join(format!("{}.json", id))
    }

    /// atomic write: temp -> fsync -> rename -> fsync parent
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        #[cfg(test)]
        if self
            .fail_writes_to
            .lock()
            .map(|p| p.as_deref() == Some(path))
            .unwrap_or(false)
        {
            return Err(Error::Io {
                path: path.to_path_buf(),
                source: io::Error::other("injected write failure"),
            });
        }

        let tmp_path = self.tmp_path().join(uuid::Uuid::new_v4().to_string());
        {
            let mut tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
            tmp_file.write_all(data).with_path(&tmp_path)?;
            tmp_file.sync_all().with_path(&tmp_path)?;
        }

        fs::rename(&tmp_path, path).with_path(path)?;

        if let Some(parent) = path.parent() {
            fsync_dir(parent)?;
        }
        Ok(())
    }

    fn write_record<T: Serialize>(&self, path: &Path, record: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(record)?;
        self.write_atomic(path, &data)
    }

    /// unpack a diff stream into a temp file, returning its digest and size
    fn stage_diff(&self, diff: &mut dyn Read) -> Result<(PathBuf, Digest, u64)> {
        let tmp_path = self.tmp_path().join(uuid::Uuid::new_v4().to_string());

        match self.unpack_to(&tmp_path, diff) {
            Ok((digest, size)) => Ok((tmp_path, digest, size)),
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    fn unpack_to(&self, tmp_path: &Path, diff: &mut dyn Read) -> Result<(Digest, u64)> {
        // short reads must not hide the magic bytes
        let mut head = Vec::with_capacity(4);
        (&mut *diff).take(4).read_to_end(&mut head).with_path(tmp_path)?;
        let compression = Compression::detect(&head);
        let mut reader = compression.decoder(BufReader::new(io::Cursor::new(head).chain(diff)))?;

        let mut digester = Digester::new();
        let mut tmp_file = File::create(tmp_path).with_path(tmp_path)?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).with_path(tmp_path)?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
            tmp_file.write_all(&buf[..n]).with_path(tmp_path)?;
        }
        tmp_file.sync_all().with_path(tmp_path)?;

        let size = digester.len();
        Ok((digester.finalize(), size))
    }

    fn create_layer_locked(
        &self,
        parent: Option<&str>,
        read_only: bool,
        diff: &mut dyn Read,
    ) -> Result<Layer> {
        if let Some(parent) = parent {
            self.layer(parent)?;
        }

        let id = random_id();
        let (tmp_path, diff_digest, diff_size) = self.stage_diff(diff)?;
        let diff_path = self.layer_diff_path(&id);
        fs::rename(&tmp_path, &diff_path).with_path(&diff_path)?;

        let layer = Layer {
            id: id.clone(),
            parent: parent.map(str::to_string),
            read_only,
            diff_digest,
            diff_size,
            created: Utc::now(),
        };
        if let Err(e) = self.write_record(&self.layer_record_path(&id), &layer) {
            let _ = fs::remove_file(&diff_path);
            return Err(e);
        }

        debug!(layer = %id, parent = ?parent, size = diff_size, "created layer");
        Ok(layer)
    }

    /// is anything still built on top of this layer
    fn layer_in_use(&self, id: &str) -> Result<bool> {
        if self.images()?.iter().any(|i| i.top_layer == id) {
            return Ok(true);
        }
        if self.containers()?.iter().any(|c| c.layer_id == id) {
            return Ok(true);
        }
        Ok(self
            .layers()?
            .iter()
            .any(|l| l.parent.as_deref() == Some(id)))
    }

    fn delete_layer_locked(&self, id: &str) -> Result<()> {
        self.layer(id)?;
        if self.layer_in_use(id)? {
            return Err(Error::LayerInUse(id.to_string()));
        }

        // record first, so readers never see a layer without its diff
        let record = self.layer_record_path(id);
        fs::remove_file(&record).with_path(&record)?;
        let diff = self.layer_diff_path(id);
        if diff.exists() {
            fs::remove_file(&diff).with_path(&diff)?;
        }

        debug!(layer = %id, "deleted layer");
        Ok(())
    }
}

impl Store for FsStore {
    fn create_layer(
        &self,
        parent: Option<&str>,
        read_only: bool,
        diff: &mut dyn Read,
    ) -> Result<Layer> {
        let _lock = self.lock()?;
        self.create_layer_locked(parent, read_only, diff)
    }

    fn layer(&self, id: &str) -> Result<Layer> {
        if !is_valid_id(id) {
            return Err(Error::LayerNotFound(id.to_string()));
        }
        read_record(&self.layer_record_path(id), || {
            Error::LayerNotFound(id.to_string())
        })
    }

    fn layers(&self) -> Result<Vec<Layer>> {
        let mut layers: Vec<Layer> = Vec::new();
        for path in list_dir(&self.layers_path())? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            layers.push(read_record(&path, || {
                Error::LayerNotFound(path.display().to_string())
            })?);
        }
        layers.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(layers)
    }

    fn set_layer_diff(&self, id: &str, diff: &mut dyn Read) -> Result<Layer> {
        let _lock = self.lock()?;
        let mut layer = self.layer(id)?;
        if layer.read_only {
            return Err(Error::LayerReadOnly(id.to_string()));
        }

        let (tmp_path, diff_digest, diff_size) = self.stage_diff(diff)?;
        let diff_path = self.layer_diff_path(id);
        fs::rename(&tmp_path, &diff_path).with_path(&diff_path)?;

        layer.diff_digest = diff_digest;
        layer.diff_size = diff_size;
        self.write_record(&self.layer_record_path(id), &layer)?;
        Ok(layer)
    }

    fn delete_layer(&self, id: &str) -> Result<()> {
        let _lock = self.lock()?;
        self.delete_layer_locked(id)
    }

    fn diff(&self, from: Option<&str>, to: &str) -> Result<Box<dyn Read + Send>> {
        let layer = self.layer(to)?;
        if layer.parent.as_deref() != from {
            return Err(Error::UnsupportedDiff {
                from: from.map(str::to_string),
                to: to.to_string(),
            });
        }

        let path = self.layer_diff_path(to);
        let file = File::open(&path).with_path(&path)?;
        Ok(Box::new(file))
    }

    fn create_image(
        &self,
        id: Option<&str>,
        names: &[String],
        top_layer: &str,
        metadata: &str,
    ) -> Result<Image> {
        let _lock = self.lock()?;
        self.layer(top_layer)?;

        let id = match id {
            Some(id) if !is_valid_id(id) => return Err(Error::DuplicateId(id.to_string())),
            Some(id) => id.to_string(),
            None => random_id(),
        };
        if self.image_dir(&id).exists() {
            return Err(Error::DuplicateId(id));
        }
        for other in self.images()? {
            if let Some(name) = names.iter().find(|n| other.has_name(n)) {
                return Err(Error::NameInUse(name.clone()));
            }
        }

        let big_data_dir = self.image_dir(&id).join("big-data");
        fs::create_dir_all(&big_data_dir).with_path(&big_data_dir)?;

        let image = Image {
            id: id.clone(),
            names: dedup(names),
            top_layer: top_layer.to_string(),
            metadata: metadata.to_string(),
            big_data: Default::default(),
            created: Utc::now(),
        };
        if let Err(e) = self.write_record(&self.image_record_path(&id), &image) {
            let _ = fs::remove_dir_all(self.image_dir(&id));
            return Err(e);
        }

        debug!(image = %id, layer = %top_layer, "created image");
        Ok(image)
    }

    fn image(&self, id_or_name: &str) -> Result<Image> {
        if is_valid_id(id_or_name) {
            let path = self.image_record_path(id_or_name);
            if path.exists() {
                return read_record(&path, || Error::ImageNotFound(id_or_name.to_string()));
            }
        }

        self.images()?
            .into_iter()
            .find(|i| i.has_name(id_or_name))
            .ok_or_else(|| Error::ImageNotFound(id_or_name.to_string()))
    }

    fn images(&self) -> Result<Vec<Image>> {
        let mut images: Vec<Image> = Vec::new();
        for dir in list_dir(&self.images_path())? {
            let path = dir.join("image.json");
            // a directory without a record is an image still being created
            if !path.exists() {
                continue;
            }
            images.push(read_record(&path, || {
                Error::ImageNotFound(dir.display().to_string())
            })?);
        }
        images.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(images)
    }

    fn delete_image(&self, id: &str, delete_layers: bool) -> Result<Vec<String>> {
        let _lock = self.lock()?;
        let image = self.image(id)?;

        if self
            .containers()?
            .iter()
            .any(|c| c.image_id.as_deref() == Some(image.id.as_str()))
        {
            return Err(Error::ImageInUse(image.id));
        }

        let record = self.image_record_path(&image.id);
        fs::remove_file(&record).with_path(&record)?;
        let dir = self.image_dir(&image.id);
        fs::remove_dir_all(&dir).with_path(&dir)?;
        debug!(image = %image.id, "deleted image");

        let mut removed = Vec::new();
        if !delete_layers {
            return Ok(removed);
        }

        let mut next = Some(image.top_layer);
        while let Some(layer_id) = next {
            let layer = match self.layer(&layer_id) {
                Ok(layer) => layer,
                Err(Error::LayerNotFound(_)) => break,
                Err(e) => return Err(e),
            };
            if self.layer_in_use(&layer_id)? {
                break;
            }
            self.delete_layer_locked(&layer_id)?;
            removed.push(layer_id);
            next = layer.parent;
        }

        Ok(removed)
    }

    fn list_image_big_data(&self, id: &str) -> Result<Vec<String>> {
        Ok(self.image(id)?.big_data_names())
    }

    fn image_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>> {
        let image = self.image(id)?;
        let info = image
            .big_data
            .get(key)
            .ok_or_else(|| Error::BigDataNotFound {
                image: image.id.clone(),
                key: key.to_string(),
            })?;

        let path = self.big_data_path(&image.id, key);
        let data = fs::read(&path).with_path(&path)?;

        // verify digest
        let actual = Digest::of(&data);
        if actual != info.digest {
            return Err(Error::DigestMismatch {
                expected: info.digest,
                actual,
            });
        }

        Ok(data)
    }

    fn set_image_big_data(&self, id: &str, key: &str, data: &[u8]) -> Result<()> {
        let _lock = self.lock()?;
        let mut image = self.image(id)?;

        self.write_atomic(&self.big_data_path(&image.id, key), data)?;
        image.big_data.insert(
            key.to_string(),
            BigDataInfo {
                digest: Digest::of(data),
                size: data.len() as u64,
            },
        );
        self.write_record(&self.image_record_path(&image.id), &image)
    }

    fn set_metadata(&self, id: &str, metadata: &str) -> Result<()> {
        let _lock = self.lock()?;
        let mut image = self.image(id)?;
        image.metadata = metadata.to_string();
        self.write_record(&self.image_record_path(&image.id), &image)
    }

    fn set_names(&self, id: &str, names: &[String]) -> Result<()> {
        let _lock = self.lock()?;
        let mut image = self.image(id)?;
        let names = dedup(names);

        // bind first: a failure below leaves a name on two images, never on none
        image.names = names.clone();
        self.write_record(&self.image_record_path(&image.id), &image)?;
        debug!(image = %image.id, names = ?names, "assigned names");

        // a name belongs to one image at a time
        for mut other in self.images()? {
            if other.id == image.id {
                continue;
            }
            let before = other.names.len();
            other.names.retain(|n| !names.contains(n));
            if other.names.len() != before {
                self.write_record(&self.image_record_path(&other.id), &other)?;
                debug!(image = %other.id, "moved names off image");
            }
        }

        Ok(())
    }

    fn create_container(
        &self,
        id: Option<&str>,
        names: &[String],
        image: Option<&str>,
        metadata: &str,
    ) -> Result<Container> {
        let _lock = self.lock()?;
        let image = image.map(|i| self.image(i)).transpose()?;

        let id = match id {
            Some(id) if !is_valid_id(id) => return Err(Error::DuplicateId(id.to_string())),
            Some(id) => id.to_string(),
            None => random_id(),
        };
        if self.container_record_path(&id).exists() {
            return Err(Error::DuplicateId(id));
        }
        for other in self.containers()? {
            if let Some(name) = names.iter().find(|n| other.names.contains(n)) {
                return Err(Error::NameInUse(name.clone()));
            }
        }

        let parent = image.as_ref().map(|i| i.top_layer.as_str());
        let layer = self.create_layer_locked(parent, false, &mut io::empty())?;

        let container = Container {
            id: id.clone(),
            names: dedup(names),
            image_id: image.map(|i| i.id),
            layer_id: layer.id.clone(),
            metadata: metadata.to_string(),
            created: Utc::now(),
        };
        if let Err(e) = self.write_record(&self.container_record_path(&id), &container) {
            let _ = self.delete_layer_locked(&layer.id);
            return Err(e);
        }

        debug!(container = %id, layer = %layer.id, "created container");
        Ok(container)
    }

    fn container(&self, id_or_name: &str) -> Result<Container> {
        if is_valid_id(id_or_name) {
            let path = self.container_record_path(id_or_name);
            if path.exists() {
                return read_record(&path, || {
                    Error::ContainerNotFound(id_or_name.to_string())
                });
            }
        }

        self.containers()?
            .into_iter()
            .find(|c| c.names.iter().any(|n| n == id_or_name))
            .ok_or_else(|| Error::ContainerNotFound(id_or_name.to_string()))
    }

    fn containers(&self) -> Result<Vec<Container>> {
        let mut containers: Vec<Container> = Vec::new();
        for path in list_dir(&self.containers_path())? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            containers.push(read_record(&path, || {
                Error::ContainerNotFound(path.display().to_string())
            })?);
        }
        containers.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(containers)
    }

    fn set_container_metadata(&self, id: &str, metadata: &str) -> Result<()> {
        let _lock = self.lock()?;
        let mut container = self.container(id)?;
        container.metadata = metadata.to_string();
        self.write_record(&self.container_record_path(&container.id), &container)
    }

    fn delete_container(&self, id: &str) -> Result<()> {
        let _lock = self.lock()?;
        let container = self.container(id)?;

        let record = self.container_record_path(&container.id);
        fs::remove_file(&record).with_path(&record)?;
        self.delete_layer_locked(&container.layer_id)?;

        debug!(container = %container.id, "deleted container");
        Ok(())
    }
}

/// guard that holds the store lock until dropped
pub struct StoreLock {
    #[allow(dead_code)]
    flock: Flock<File>,
}

/// ids become path components, so they can't contain separators
fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains('/')
        && !id.contains('\0')
}

fn dedup(names: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !out.contains(name) {
            out.push(name.clone());
        }
    }
    out
}

fn read_record<T: DeserializeOwned>(path: &Path, missing: impl FnOnce() -> Error) -> Result<T> {
    let data = fs::read(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            missing()
        } else {
            Error::Io {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;
    Ok(serde_json::from_slice(&data)?)
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    if !dir.exists() {
        return Ok(paths);
    }
    for entry in fs::read_dir(dir).with_path(dir)? {
        let entry = entry.with_path(dir)?;
        paths.push(entry.path());
    }
    Ok(paths)
}

/// fsync a directory
fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, FsStore) {
        let dir = tempdir().unwrap();
        let store = FsStore::init(&dir.path().join("store")).unwrap();
        (dir, store)
    }

    fn read_diff(store: &FsStore, from: Option<&str>, to: &str) -> Vec<u8> {
        let mut out = Vec::new();
        store.diff(from, to).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_store_init() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");

        FsStore::init(&path).unwrap();

        assert!(path.join("layers").is_dir());
        assert!(path.join("images").is_dir());
        assert!(path.join("containers").is_dir());
        assert!(path.join("tmp").is_dir());
        assert!(path.join("config.toml").is_file());
    }

    #[test]
    fn test_store_init_already_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");

        FsStore::init(&path).unwrap();
        let result = FsStore::init(&path);

        assert!(matches!(result, Err(Error::StoreExists(_))));
    }

    #[test]
    fn test_store_open_not_found() {
        let dir = tempdir().unwrap();
        let result = FsStore::open(&dir.path().join("nonexistent"));
        assert!(matches!(result, Err(Error::NoStore(_))));
    }

    #[test]
    fn test_config_modification() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        let mut store = FsStore::init(&path).unwrap();

        store
            .config_mut()
            .add_remote("prod", "docker://registry.example/app")
            .unwrap();
        store.save_config().unwrap();

        let reopened = FsStore::open(&path).unwrap();
        assert_eq!(reopened.config().remotes.len(), 1);
        assert_eq!(reopened.config().remotes[0].name, "prod");
    }

    #[test]
    fn test_store_lock() {
        let (_dir, store) = test_store();

        let lock = store.lock().unwrap();
        assert!(store.try_lock().unwrap().is_none());

        drop(lock);
        assert!(store.try_lock().unwrap().is_some());
    }

    #[test]
    fn test_create_layer_and_diff() {
        let (_dir, store) = test_store();

        let base = store
            .create_layer(None, true, &mut &b"base contents"[..])
            .unwrap();
        let child = store
            .create_layer(Some(&base.id), true, &mut &b"child contents"[..])
            .unwrap();

        assert_eq!(base.diff_digest, Digest::of(b"base contents"));
        assert_eq!(child.parent.as_deref(), Some(base.id.as_str()));
        assert_eq!(read_diff(&store, None, &base.id), b"base contents");
        assert_eq!(read_diff(&store, Some(&base.id), &child.id), b"child contents");
        assert_eq!(store.layers().unwrap().len(), 2);
    }

    #[test]
    fn test_create_layer_unpacks_compressed_diff() {
        let (_dir, store) = test_store();

        let raw = vec![0u8; 1024];
        for compression in [Compression::Gzip, Compression::Zstd] {
            let packed = compression.compress(&raw).unwrap();
            let layer = store.create_layer(None, true, &mut packed.as_slice()).unwrap();

            assert_eq!(layer.diff_size, 1024);
            assert_eq!(layer.diff_digest, Digest::of(&raw));
            assert_eq!(read_diff(&store, None, &layer.id), raw);
        }
    }

    /// hands out one byte per read
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match (self.0.split_first(), buf.first_mut()) {
                (Some((b, rest)), Some(slot)) => {
                    *slot = *b;
                    self.0 = rest;
                    Ok(1)
                }
                _ => Ok(0),
            }
        }
    }

    #[test]
    fn test_create_layer_detects_compression_across_short_reads() {
        let (_dir, store) = test_store();

        let raw = b"trickled layer contents".to_vec();
        for compression in [Compression::Gzip, Compression::Zstd] {
            let packed = compression.compress(&raw).unwrap();
            let layer = store
                .create_layer(None, true, &mut Trickle(&packed))
                .unwrap();

            assert_eq!(layer.diff_digest, Digest::of(&raw));
            assert_eq!(read_diff(&store, None, &layer.id), raw);
        }

        // shorter than any magic number
        let layer = store.create_layer(None, true, &mut Trickle(b"ab")).unwrap();
        assert_eq!(read_diff(&store, None, &layer.id), b"ab");
    }

    #[test]
    fn test_create_layer_missing_parent() {
        let (_dir, store) = test_store();
        let result = store.create_layer(Some("nope"), true, &mut io::empty());
        assert!(matches!(result, Err(Error::LayerNotFound(_))));
    }

    #[test]
    fn test_diff_against_non_parent() {
        let (_dir, store) = test_store();
        let base = store.create_layer(None, true, &mut io::empty()).unwrap();
        let child = store
            .create_layer(Some(&base.id), true, &mut io::empty())
            .unwrap();

        let result = store.diff(None, &child.id);
        assert!(matches!(result, Err(Error::UnsupportedDiff { .. })));
    }

    #[test]
    fn test_create_image_and_lookup() {
        let (_dir, store) = test_store();
        let layer = store.create_layer(None, true, &mut io::empty()).unwrap();

        let image = store
            .create_image(None, &names(&["app:1", "app:1"]), &layer.id, "{}")
            .unwrap();

        assert_eq!(image.names, names(&["app:1"]));
        assert_eq!(store.image(&image.id).unwrap(), image);
        assert_eq!(store.image("app:1").unwrap().id, image.id);
        assert!(matches!(store.image("app:2"), Err(Error::ImageNotFound(_))));
    }

    #[test]
    fn test_create_image_rejects_used_name() {
        let (_dir, store) = test_store();
        let layer = store.create_layer(None, true, &mut io::empty()).unwrap();

        store
            .create_image(None, &names(&["app:1"]), &layer.id, "")
            .unwrap();
        let result = store.create_image(None, &names(&["app:1"]), &layer.id, "");

        assert!(matches!(result, Err(Error::NameInUse(_))));
    }

    #[test]
    fn test_create_image_missing_layer() {
        let (_dir, store) = test_store();
        let result = store.create_image(None, &[], "missing", "");
        assert!(matches!(result, Err(Error::LayerNotFound(_))));
    }

    #[test]
    fn test_set_names_moves_names() {
        let (_dir, store) = test_store();
        let layer = store.create_layer(None, true, &mut io::empty()).unwrap();

        let first = store
            .create_image(None, &names(&["app:1", "app:latest"]), &layer.id, "")
            .unwrap();
        let second = store.create_image(None, &[], &layer.id, "").unwrap();

        store.set_names(&second.id, &names(&["app:latest"])).unwrap();

        assert_eq!(store.image(&first.id).unwrap().names, names(&["app:1"]));
        assert_eq!(store.image("app:latest").unwrap().id, second.id);
    }

    #[test]
    fn test_set_names_failure_keeps_existing_binding() {
        let (_dir, store) = test_store();
        let layer = store.create_layer(None, true, &mut io::empty()).unwrap();

        let old = store
            .create_image(None, &names(&["app:latest"]), &layer.id, "")
            .unwrap();
        let new = store.create_image(None, &[], &layer.id, "").unwrap();

        *store.fail_writes_to.lock().unwrap() = Some(store.image_record_path(&new.id));
        let result = store.set_names(&new.id, &names(&["app:latest"]));
        *store.fail_writes_to.lock().unwrap() = None;

        assert!(matches!(result, Err(Error::Io { .. })));
        assert_eq!(store.image("app:latest").unwrap().id, old.id);
        assert_eq!(store.image(&old.id).unwrap().names, names(&["app:latest"]));
        assert!(store.image(&new.id).unwrap().names.is_empty());
    }

    #[test]
    fn test_set_names_failure_moving_names_leaves_them_bound() {
        let (_dir, store) = test_store();
        let layer = store.create_layer(None, true, &mut io::empty()).unwrap();

        let old = store
            .create_image(None, &names(&["app:latest"]), &layer.id, "")
            .unwrap();
        let new = store.create_image(None, &[], &layer.id, "").unwrap();

        *store.fail_writes_to.lock().unwrap() = Some(store.image_record_path(&old.id));
        let result = store.set_names(&new.id, &names(&["app:latest"]));
        *store.fail_writes_to.lock().unwrap() = None;

        // dropping the new image must give the name back to the old one alone
        assert!(result.is_err());
        store.delete_image(&new.id, false).unwrap();
        assert_eq!(store.image("app:latest").unwrap().id, old.id);
    }

    #[test]
    fn test_big_data_roundtrip() {
        let (_dir, store) = test_store();
        let layer = store.create_layer(None, true, &mut io::empty()).unwrap();
        let image = store.create_image(None, &[], &layer.id, "").unwrap();

        store
            .set_image_big_data(&image.id, "manifest", b"{\"schemaVersion\":2}")
            .unwrap();
        store
            .set_image_big_data(&image.id, "sha256:abc/with slash", b"cfg")
            .unwrap();

        let keys = store.list_image_big_data(&image.id).unwrap();
        assert_eq!(keys, names(&["manifest", "sha256:abc/with slash"]));
        assert_eq!(
            store.image_big_data(&image.id, "sha256:abc/with slash").unwrap(),
            b"cfg"
        );

        let info = &store.image(&image.id).unwrap().big_data["manifest"];
        assert_eq!(info.digest, Digest::of(b"{\"schemaVersion\":2}"));
        assert_eq!(info.size, 19);
    }

    #[test]
    fn test_big_data_missing_key() {
        let (_dir, store) = test_store();
        let layer = store.create_layer(None, true, &mut io::empty()).unwrap();
        let image = store.create_image(None, &[], &layer.id, "").unwrap();

        let result = store.image_big_data(&image.id, "manifest");
        assert!(matches!(result, Err(Error::BigDataNotFound { .. })));
    }

    #[test]
    fn test_big_data_corruption_detected() {
        let (_dir, store) = test_store();
        let layer = store.create_layer(None, true, &mut io::empty()).unwrap();
        let image = store.create_image(None, &[], &layer.id, "").unwrap();
        store.set_image_big_data(&image.id, "config", b"good").unwrap();

        fs::write(store.big_data_path(&image.id, "config"), b"evil").unwrap();

        let result = store.image_big_data(&image.id, "config");
        assert!(matches!(result, Err(Error::DigestMismatch { .. })));
    }

    #[test]
    fn test_set_metadata() {
        let (_dir, store) = test_store();
        let layer = store.create_layer(None, true, &mut io::empty()).unwrap();
        let image = store.create_image(None, &[], &layer.id, "").unwrap();

        store.set_metadata(&image.id, "{}").unwrap();
        assert_eq!(store.image(&image.id).unwrap().metadata, "{}");
    }

    #[test]
    fn test_delete_image_keeps_shared_layers() {
        let (_dir, store) = test_store();
        let base = store.create_layer(None, true, &mut io::empty()).unwrap();
        let top = store
            .create_layer(Some(&base.id), true, &mut io::empty())
            .unwrap();
        let other = store
            .create_layer(Some(&base.id), true, &mut io::empty())
            .unwrap();

        let doomed = store.create_image(None, &[], &top.id, "").unwrap();
        store.create_image(None, &[], &other.id, "").unwrap();

        let removed = store.delete_image(&doomed.id, true).unwrap();

        assert_eq!(removed, vec![top.id.clone()]);
        assert!(store.layer(&base.id).is_ok());
        assert!(matches!(store.image(&doomed.id), Err(Error::ImageNotFound(_))));
    }

    #[test]
    fn test_delete_image_without_layers() {
        let (_dir, store) = test_store();
        let layer = store.create_layer(None, true, &mut io::empty()).unwrap();
        let image = store.create_image(None, &[], &layer.id, "").unwrap();

        let removed = store.delete_image(&image.id, false).unwrap();

        assert!(removed.is_empty());
        assert!(store.layer(&layer.id).is_ok());
    }

    #[test]
    fn test_delete_image_used_by_container() {
        let (_dir, store) = test_store();
        let layer = store.create_layer(None, true, &mut io::empty()).unwrap();
        let image = store
            .create_image(None, &names(&["base:1"]), &layer.id, "")
            .unwrap();
        let container = store
            .create_container(None, &[], Some("base:1"), "")
            .unwrap();

        let result = store.delete_image(&image.id, true);
        assert!(matches!(result, Err(Error::ImageInUse(ref id)) if *id == image.id));
        assert_eq!(store.image("base:1").unwrap().id, image.id);
        assert!(store.layer(&layer.id).is_ok());

        store.delete_container(&container.id).unwrap();
        assert_eq!(store.delete_image(&image.id, true).unwrap(), vec![layer.id]);
    }

    #[test]
    fn test_delete_layer_in_use() {
        let (_dir, store) = test_store();
        let layer = store.create_layer(None, true, &mut io::empty()).unwrap();
        store.create_image(None, &[], &layer.id, "").unwrap();

        let result = store.delete_layer(&layer.id);
        assert!(matches!(result, Err(Error::LayerInUse(_))));
    }

    #[test]
    fn test_container_lifecycle() {
        let (_dir, store) = test_store();
        let base = store.create_layer(None, true, &mut io::empty()).unwrap();
        let image = store
            .create_image(None, &names(&["base:1"]), &base.id, "")
            .unwrap();

        let container = store
            .create_container(None, &names(&["work"]), Some("base:1"), "")
            .unwrap();
        assert_eq!(container.image_id.as_deref(), Some(image.id.as_str()));

        let layer = store.layer(&container.layer_id).unwrap();
        assert!(!layer.read_only);
        assert_eq!(layer.parent.as_deref(), Some(base.id.as_str()));
        assert_eq!(store.container("work").unwrap().id, container.id);

        let updated = store
            .set_layer_diff(&container.layer_id, &mut &b"changes"[..])
            .unwrap();
        assert_eq!(updated.diff_digest, Digest::of(b"changes"));
        assert_eq!(read_diff(&store, Some(&base.id), &container.layer_id), b"changes");

        store.set_container_metadata(&container.id, "{\"a\":1}").unwrap();
        assert_eq!(store.container(&container.id).unwrap().metadata, "{\"a\":1}");

        store.delete_container(&container.id).unwrap();
        assert!(store.containers().unwrap().is_empty());
        assert!(matches!(
            store.layer(&container.layer_id),
            Err(Error::LayerNotFound(_))
        ));
    }

    #[test]
    fn test_set_layer_diff_read_only() {
        let (_dir, store) = test_store();
        let layer = store.create_layer(None, true, &mut io::empty()).unwrap();

        let result = store.set_layer_diff(&layer.id, &mut &b"x"[..]);
        assert!(matches!(result, Err(Error::LayerReadOnly(_))));
    }

    #[test]
    fn test_tmp_dir_left_clean() {
        let (_dir, store) = test_store();
        let layer = store.create_layer(None, true, &mut &b"abc"[..]).unwrap();
        let image = store.create_image(None, &[], &layer.id, "").unwrap();
        store.set_image_big_data(&image.id, "k", b"v").unwrap();

        assert_eq!(fs::read_dir(store.tmp_path()).unwrap().count(), 0);
    }
}
