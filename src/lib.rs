//! imprint - image commit/export engine
//!
//! turns a working container's filesystem changes and accumulated
//! configuration into an immutable, content-addressed image, stored locally or
//! exported to another destination.
//!
//! # Core concepts
//!
//! - **Layer**: a filesystem diff stacked on an optional parent layer
//! - **Image**: a top layer plus named data items (config, manifest) and names
//! - **Container**: a writable layer on top of an image, edited through a [`Builder`]
//! - **Reference**: where an image is written: the local store, a `dir:` or a registry
//!
//! # Commit paths
//!
//! committing into the local store takes a shortcut: only the container's newest
//! layer, the config and the manifest are written, staged through a temporary
//! image and rolled back on failure. any other destination gets a full copy of
//! every layer, checked against the signature policy.
//!
//! # Example usage
//!
//! ```no_run
//! use imprint::{Builder, FsStore};
//! use imprint::ops::{CommitOptions, Engine};
//! use imprint::transport::parse_reference;
//! use std::path::Path;
//!
//! let store = FsStore::open(Path::new("/var/lib/imprint")).unwrap();
//! let builder = Builder::new(&store, "scratch").unwrap();
//!
//! let dest = parse_reference("myimage:latest").unwrap();
//! let report = Engine::new(&store)
//!     .commit(&builder, &dest, CommitOptions::default())
//!     .unwrap();
//! println!("{:?}", report.image_id);
//! ```

mod builder;
mod compression;
mod config;
mod copy;
mod digest;
mod error;
mod policy;

pub mod image;
pub mod ops;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use builder::{default_architecture, Builder, SCRATCH};
pub use compression::Compression;
pub use config::{Config, Defaults, Remote};
pub use copy::{BasicCopier, CopyOptions, ImageCopier};
pub use digest::{Digest, Digester};
pub use error::{Error, IoResultExt, Result, StoreResultExt};
pub use policy::{
    FilePolicyEngine, Policy, PolicyContext, PolicyEngine, Requirement, DEFAULT_POLICY_PATH,
};
pub use store::{add_image_names, images_matching, random_id, FsStore, Store};
