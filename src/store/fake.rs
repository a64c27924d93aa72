//! In-memory backing store and filter used by store and glob tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    BackingStore, BlobMetadata, ObjectComparison, ObjectId, RootId, RootTree, StoreError, Tree,
};
use crate::path::RelativePath;

/// A backing store whose contents are populated by tests.
#[derive(Default)]
pub(crate) struct FakeBackingStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    trees: HashMap<ObjectId, Arc<Tree>>,
    blobs: HashMap<ObjectId, Vec<u8>>,
    roots: HashMap<RootId, ObjectId>,
    prefetched: Vec<Vec<ObjectId>>,
}

impl FakeBackingStore {
    pub fn new() -> FakeBackingStore {
        FakeBackingStore::default()
    }

    pub fn put_tree(&self, id: ObjectId, tree: Tree) {
        self.inner.lock().trees.insert(id, Arc::new(tree));
    }

    pub fn put_blob(&self, id: ObjectId, data: Vec<u8>) {
        self.inner.lock().blobs.insert(id, data);
    }

    pub fn put_root(&self, root: RootId, tree_id: ObjectId) {
        self.inner.lock().roots.insert(root, tree_id);
    }

    /// Batches handed to `prefetch_blobs`, in call order.
    pub fn prefetch_batches(&self) -> Vec<Vec<ObjectId>> {
        self.inner.lock().prefetched.clone()
    }
}

impl BackingStore for FakeBackingStore {
    fn get_root_tree(&self, root_id: &RootId) -> Result<RootTree, StoreError> {
        let inner = self.inner.lock();
        let tree_id = inner
            .roots
            .get(root_id)
            .ok_or_else(|| StoreError::RootNotFound(root_id.clone()))?;
        let tree = inner
            .trees
            .get(tree_id)
            .ok_or_else(|| StoreError::NotFound(tree_id.clone()))?;
        Ok(RootTree {
            tree: tree.clone(),
            tree_id: tree_id.clone(),
        })
    }

    fn get_tree(&self, id: &ObjectId) -> Result<Arc<Tree>, StoreError> {
        self.inner
            .lock()
            .trees
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn get_blob(&self, id: &ObjectId) -> Result<Vec<u8>, StoreError> {
        self.inner
            .lock()
            .blobs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn get_blob_metadata(&self, id: &ObjectId) -> Result<BlobMetadata, StoreError> {
        let blob = self.get_blob(id)?;
        Ok(BlobMetadata {
            size: blob.len() as u64,
            content_hash: id.as_bytes().to_vec(),
        })
    }

    fn prefetch_blobs(&self, ids: &[ObjectId]) -> Result<(), StoreError> {
        self.inner.lock().prefetched.push(ids.to_vec());
        Ok(())
    }

    fn compare_objects_by_id(
        &self,
        a: &ObjectId,
        b: &ObjectId,
    ) -> Result<ObjectComparison, StoreError> {
        // Fake ids are canonical, so bytewise equality is exact.
        if a == b {
            Ok(ObjectComparison::Identical)
        } else {
            Ok(ObjectComparison::Different)
        }
    }
}

/// Filter that hides every path starting with the filter id, mirroring the
/// shape of a sparse-profile filter keyed by directory prefix.
pub(crate) struct PrefixFilter;

impl super::Filter for PrefixFilter {
    fn is_path_filtered(&self, path: &RelativePath, filter_id: &str) -> bool {
        path.as_bytes().starts_with(filter_id.as_bytes())
    }
}
