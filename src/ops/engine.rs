use crate::copy::{BasicCopier, ImageCopier};
use crate::error::Error;
use crate::image::{SourceViewBuilder, StoreViewBuilder};
use crate::policy::{FilePolicyEngine, PolicyEngine};
use crate::store::Store;

/// commit and push over a store, with pluggable policy, view and copy services
pub struct Engine<'a> {
    pub(super) store: &'a dyn Store,
    pub(super) policy: Box<dyn PolicyEngine + 'a>,
    pub(super) views: Box<dyn SourceViewBuilder + 'a>,
    pub(super) copier: Box<dyn ImageCopier + 'a>,
}

impl<'a> Engine<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self {
            store,
            policy: Box::new(FilePolicyEngine::default()),
            views: Box::new(StoreViewBuilder),
            copier: Box::new(BasicCopier),
        }
    }

    pub fn with_policy_engine(mut self, policy: impl PolicyEngine + 'a) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn with_view_builder(mut self, views: impl SourceViewBuilder + 'a) -> Self {
        self.views = Box::new(views);
        self
    }

    pub fn with_copier(mut self, copier: impl ImageCopier + 'a) -> Self {
        self.copier = Box::new(copier);
        self
    }

    pub fn store(&self) -> &'a dyn Store {
        self.store
    }
}

pub(super) fn policy_error(source: Error) -> Error {
    Error::PolicyConstruction {
        source: Box::new(source),
    }
}

pub(super) fn source_view_error(context: &str) -> impl FnOnce(Error) -> Error + '_ {
    move |source| Error::SourceView {
        context: context.to_string(),
        source: Box::new(source),
    }
}

pub(super) fn copy_error(context: &str) -> impl FnOnce(Error) -> Error + '_ {
    move |source| Error::Copy {
        context: context.to_string(),
        source: Box::new(source),
    }
}
