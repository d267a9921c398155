//! high-level operations: commit and push

mod commit;
mod engine;
mod push;
mod shallow;

pub use commit::{CommitOptions, CommitPath, CommitReport};
pub use engine::Engine;
pub use push::PushOptions;
pub use shallow::{shallow_copy, TEMPORARY_IMAGE_SUFFIX};
