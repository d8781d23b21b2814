use std::sync::Arc;

use stampede_cache::{BinaryFileStore, FileLayout, MemoryStore, SourceFileStore, Store};
use stampede_test as test;

pub use test::{Counter, TempDir};

/// The raw stores every cache property is checked against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Binary,
    Source,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Memory, Backend::Binary, Backend::Source];

    /// Opens a store of this kind in `dir`, with garbage collection turned off.
    ///
    /// The memory store ignores `dir`.
    pub fn open(self, dir: &TempDir) -> Arc<dyn Store> {
        match self {
            Backend::Memory => Arc::new(MemoryStore::new()),
            Backend::Binary => {
                let layout = FileLayout::new(dir.path(), BinaryFileStore::SUFFIX).gc_probability(0);
                Arc::new(BinaryFileStore::new(layout).unwrap())
            }
            Backend::Source => {
                let layout = FileLayout::new(dir.path(), SourceFileStore::SUFFIX).gc_probability(0);
                Arc::new(SourceFileStore::new(layout).unwrap())
            }
        }
    }
}

/// Setup tests and open a store for `backend`.
///
/// The returned [`TempDir`] is the store directory of file backends. Keep it as guard until
/// the test has finished.
pub fn setup_store(backend: Backend) -> (Arc<dyn Store>, TempDir) {
    test::setup();
    let dir = test::tempdir();
    let store = backend.open(&dir);
    (store, dir)
}
