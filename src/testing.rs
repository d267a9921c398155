//! test helpers: a fault-injecting store and recording collaborators

use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::builder::Builder;
use crate::compression::Compression;
use crate::copy::{CopyOptions, ImageCopier};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::image::{
    BlobInfo, ImageSource, SourceViewBuilder, StoreViewBuilder, ViewOptions,
};
use crate::policy::PolicyContext;
use crate::store::{add_image_names, FsStore, Store};
use crate::transport::{expand_tag, ImageReference};
use crate::types::{
    Container, ContainerConfig, Descriptor, History, Image, ImageConfig, Layer, Manifest,
    ManifestType, RootFs,
};

/// an FsStore that fails a chosen mutating call
pub struct FaultyStore {
    inner: FsStore,
    calls: Cell<usize>,
    fail_at: Cell<Option<usize>>,
    fail_deletes: Cell<bool>,
    reads: Cell<usize>,
    fail_read_at: Cell<Option<usize>>,
    image_lookups: Cell<usize>,
    layer_blobs: RefCell<Vec<Vec<u8>>>,
    name_thief: RefCell<Option<(String, String)>>,
}

impl FaultyStore {
    pub fn new(path: &Path) -> Self {
        Self {
            inner: FsStore::init(path).unwrap(),
            calls: Cell::new(0),
            fail_at: Cell::new(None),
            fail_deletes: Cell::new(false),
            reads: Cell::new(0),
            fail_read_at: Cell::new(None),
            image_lookups: Cell::new(0),
            layer_blobs: RefCell::new(Vec::new()),
            name_thief: RefCell::new(None),
        }
    }

    /// reset the counters and fail the `step`th mutating call from now on
    pub fn arm(&self, step: Option<usize>) {
        self.calls.set(0);
        self.image_lookups.set(0);
        self.fail_at.set(step);
    }

    /// reset the read counter and fail the `step`th read from now on
    pub fn arm_reads(&self, step: Option<usize>) {
        self.reads.set(0);
        self.fail_read_at.set(step);
    }

    /// reads since the last `arm_reads`
    pub fn reads(&self) -> usize {
        self.reads.get()
    }

    /// mutating calls (deletes excluded) since the last `arm`
    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn image_lookups(&self) -> usize {
        self.image_lookups.get()
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.set(fail);
    }

    /// every diff handed to `create_layer`, as received
    pub fn layer_blobs(&self) -> Vec<Vec<u8>> {
        self.layer_blobs.borrow().clone()
    }

    pub fn clear_layer_blobs(&self) {
        self.layer_blobs.borrow_mut().clear();
    }

    fn tick(&self, op: &str) -> Result<()> {
        let n = self.calls.get() + 1;
        self.calls.set(n);
        if self.fail_at.get() == Some(n) {
            return Err(injected(op));
        }
        Ok(())
    }

    /// the next time `name` is bound, move it straight on to `image`, the way
    /// a concurrent commit would
    pub fn steal_name(&self, name: &str, image: &str) {
        *self.name_thief.borrow_mut() = Some((name.to_string(), image.to_string()));
    }

    fn read(&self, op: &str) -> Result<()> {
        let n = self.reads.get() + 1;
        self.reads.set(n);
        if self.fail_read_at.get() == Some(n) {
            return Err(injected(op));
        }
        Ok(())
    }

    fn delete(&self, op: &str) -> Result<()> {
        if self.fail_deletes.get() {
            return Err(injected(op));
        }
        Ok(())
    }
}

fn injected(op: &str) -> Error {
    Error::Io {
        path: PathBuf::from(op),
        source: io::Error::other("injected failure"),
    }
}

impl Store for FaultyStore {
    fn create_layer(
        &self,
        parent: Option<&str>,
        read_only: bool,
        diff: &mut dyn Read,
    ) -> Result<Layer> {
        self.tick("create_layer")?;
        let mut data = Vec::new();
        diff.read_to_end(&mut data)
            .map_err(|source| Error::Io {
                path: PathBuf::from("create_layer"),
                source,
            })?;
        self.layer_blobs.borrow_mut().push(data.clone());
        self.inner.create_layer(parent, read_only, &mut data.as_slice())
    }

    fn layer(&self, id: &str) -> Result<Layer> {
        self.read("layer")?;
        self.inner.layer(id)
    }

    fn layers(&self) -> Result<Vec<Layer>> {
        self.read("layers")?;
        self.inner.layers()
    }

    fn set_layer_diff(&self, id: &str, diff: &mut dyn Read) -> Result<Layer> {
        self.tick("set_layer_diff")?;
        self.inner.set_layer_diff(id, diff)
    }

    fn delete_layer(&self, id: &str) -> Result<()> {
        self.delete("delete_layer")?;
        self.inner.delete_layer(id)
    }

    fn diff(&self, from: Option<&str>, to: &str) -> Result<Box<dyn Read + Send>> {
        self.read("diff")?;
        self.inner.diff(from, to)
    }

    fn create_image(
        &self,
        id: Option<&str>,
        names: &[String],
        top_layer: &str,
        metadata: &str,
    ) -> Result<Image> {
        self.tick("create_image")?;
        self.inner.create_image(id, names, top_layer, metadata)
    }

    fn image(&self, id_or_name: &str) -> Result<Image> {
        self.read("image")?;
        self.image_lookups.set(self.image_lookups.get() + 1);
        self.inner.image(id_or_name)
    }

    fn images(&self) -> Result<Vec<Image>> {
        self.read("images")?;
        self.inner.images()
    }

    fn delete_image(&self, id: &str, delete_layers: bool) -> Result<Vec<String>> {
        self.delete("delete_image")?;
        self.inner.delete_image(id, delete_layers)
    }

    fn list_image_big_data(&self, id: &str) -> Result<Vec<String>> {
        self.read("list_image_big_data")?;
        self.inner.list_image_big_data(id)
    }

    fn image_big_data(&self, id: &str, key: &str) -> Result<Vec<u8>> {
        self.read("image_big_data")?;
        self.inner.image_big_data(id, key)
    }

    fn set_image_big_data(&self, id: &str, key: &str, data: &[u8]) -> Result<()> {
        self.tick("set_image_big_data")?;
        self.inner.set_image_big_data(id, key, data)
    }

    fn set_metadata(&self, id: &str, metadata: &str) -> Result<()> {
        self.tick("set_metadata")?;
        self.inner.set_metadata(id, metadata)
    }

    fn set_names(&self, id: &str, names: &[String]) -> Result<()> {
        self.tick("set_names")?;
        self.inner.set_names(id, names)?;

        let stolen = match &*self.name_thief.borrow() {
            Some((name, to)) if to != id && names.contains(name) => Some((name.clone(), to.clone())),
            _ => None,
        };
        if let Some((name, to)) = stolen {
            self.name_thief.borrow_mut().take();
            let thief = self.inner.image(&to)?;
            add_image_names(&self.inner, &thief, &[name])?;
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
        self.tick("create_container")?;
        self.inner.create_container(id, names, image, metadata)
    }

    fn container(&self, id_or_name: &str) -> Result<Container> {
        self.read("container")?;
        self.inner.container(id_or_name)
    }

    fn containers(&self) -> Result<Vec<Container>> {
        self.read("containers")?;
        self.inner.containers()
    }

    fn set_container_metadata(&self, id: &str, metadata: &str) -> Result<()> {
        self.tick("set_container_metadata")?;
        self.inner.set_container_metadata(id, metadata)
    }

    fn delete_container(&self, id: &str) -> Result<()> {
        self.delete("delete_container")?;
        self.inner.delete_container(id)
    }
}

/// store a one-layer image under `name`, configured to run `/bin/sh`
pub fn store_base_image(store: &dyn Store, name: &str) -> Image {
    let layer = b"base layer contents".to_vec();
    let layer_digest = Digest::of(&layer);

    let config = ImageConfig {
        created: None,
        author: None,
        architecture: "amd64".to_string(),
        os: "linux".to_string(),
        config: ContainerConfig {
            cmd: vec!["/bin/sh".to_string()],
            ..Default::default()
        },
        rootfs: RootFs::layers(vec![layer_digest]),
        history: vec![History {
            created_by: Some("base".to_string()),
            ..Default::default()
        }],
        parent: None,
        container_config: None,
    };
    let config = serde_json::to_vec(&config).unwrap();

    let manifest = Manifest::new(
        ManifestType::Oci,
        Descriptor {
            media_type: ManifestType::Oci.config_media_type().to_string(),
            digest: Digest::of(&config),
            size: config.len() as u64,
        },
        vec![Descriptor {
            media_type: ManifestType::Oci
                .layer_media_type(Compression::Uncompressed)
                .unwrap()
                .to_string(),
            digest: layer_digest,
            size: layer.len() as u64,
        }],
    );

    let mut dest = ImageReference::storage(name)
        .new_image_destination(store)
        .unwrap();
    dest.put_blob(&mut layer.as_slice(), &BlobInfo::default(), false)
        .unwrap();
    dest.put_blob(
        &mut config.as_slice(),
        &BlobInfo::new(Digest::of(&config), config.len() as u64),
        true,
    )
    .unwrap();
    dest.put_manifest(&manifest.to_vec().unwrap()).unwrap();
    dest.commit().unwrap();

    store.image(&expand_tag(name).unwrap()).unwrap()
}

/// write a policy.json accepting everything into `dir`
pub fn accept_all_policy(dir: &Path) -> PathBuf {
    let path = dir.join("policy.json");
    std::fs::write(&path, r#"{"default":[{"type":"insecureAcceptAnything"}]}"#).unwrap();
    path
}

/// a cloneable in-memory report writer
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// a source with fixed config and manifest bytes
pub struct StaticSource {
    config: Vec<u8>,
    manifest: Vec<u8>,
}

impl StaticSource {
    pub fn new(config: Vec<u8>, manifest: Vec<u8>) -> Self {
        Self { config, manifest }
    }
}

impl ImageSource for StaticSource {
    fn reference(&self) -> ImageReference {
        ImageReference::storage("static")
    }

    fn config_blob(&self) -> Result<Vec<u8>> {
        Ok(self.config.clone())
    }

    fn manifest(&self) -> Result<(Vec<u8>, String)> {
        Ok((
            self.manifest.clone(),
            ManifestType::Oci.manifest_media_type().to_string(),
        ))
    }

    fn get_blob(&self, digest: &Digest) -> Result<Box<dyn Read + '_>> {
        Err(Error::Transport {
            message: format!("no blob {}", digest),
        })
    }
}

/// delegates to [`StoreViewBuilder`], remembering what it was asked for
#[derive(Default)]
pub struct RecordingViews {
    exporting: RefCell<Vec<bool>>,
    top_layers: RefCell<Vec<String>>,
    empty_config: bool,
}

impl RecordingViews {
    /// container views with an empty configuration blob
    pub fn empty_config() -> Self {
        Self {
            empty_config: true,
            ..Default::default()
        }
    }

    pub fn exporting(&self) -> Vec<bool> {
        self.exporting.borrow().clone()
    }

    pub fn top_layers(&self) -> Vec<String> {
        self.top_layers.borrow().clone()
    }
}

impl SourceViewBuilder for RecordingViews {
    fn container_view(
        &self,
        store: &dyn Store,
        builder: &Builder,
        options: &ViewOptions,
    ) -> Result<Box<dyn ImageSource>> {
        self.exporting.borrow_mut().push(options.exporting);
        if self.empty_config {
            return Ok(Box::new(StaticSource::new(Vec::new(), b"{}".to_vec())));
        }
        StoreViewBuilder.container_view(store, builder, options)
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
        self.top_layers.borrow_mut().push(top_layer.to_string());
        StoreViewBuilder.image_view(store, builder, names, top_layer, compression, manifest_type)
    }
}

/// a copier that only counts
#[derive(Default)]
pub struct RecordingCopier {
    calls: Cell<usize>,
}

impl RecordingCopier {
    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl ImageCopier for RecordingCopier {
    fn copy(
        &self,
        _store: &dyn Store,
        _policy: &PolicyContext,
        _dest: &ImageReference,
        _src: &dyn ImageSource,
        _options: &mut CopyOptions,
    ) -> Result<()> {
        self.calls.set(self.calls.get() + 1);
        Ok(())
    }
}
