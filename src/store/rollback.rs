use tracing::debug;

use crate::store::Store;

/// a compensating action undone on failure
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Undo {
    DeleteLayer(String),
    /// delete an image record, leaving its layers to their own undo entries
    DeleteImage(String),
}

/// drop guard that runs registered undo actions in reverse order unless disarmed.
///
/// failures are logged and never escalate, so one failed undo doesn't stop
/// the rest of the unwind.
pub struct Rollback<'a> {
    store: &'a dyn Store,
    undo: Vec<Undo>,
}

impl<'a> Rollback<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self {
            store,
            undo: Vec::new(),
        }
    }

    pub fn push(&mut self, undo: Undo) {
        self.undo.push(undo);
    }

    /// keep everything done so far
    pub fn disarm(mut self) {
        self.undo.clear();
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        while let Some(undo) = self.undo.pop() {
            let result = match &undo {
                Undo::DeleteLayer(id) => self.store.delete_layer(id),
                Undo::DeleteImage(id) => self.store.delete_image(id, false).map(|_| ()),
            };
            match result {
                Ok(()) => debug!(?undo, "rolled back"),
                Err(e) => debug!(?undo, error = %e, "rollback step failed"),
            }
        }
    }
}
