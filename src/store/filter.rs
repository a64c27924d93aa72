//! Filtered view over a backing store.
//!
//! The filter layer drops tree entries whose paths a [`Filter`] excludes and
//! re-tags every remaining entry with a [`FilteredObjectId`] carrying the
//! active filter id, so that downstream equality checks observe filter
//! changes. Identical source objects rendered under different filters get
//! distinct ids.

use std::sync::Arc;

use super::filtered_object_id::{FilteredObjectId, FilteredObjectIdType};
use super::{
    BackingStore, BlobMetadata, ObjectComparison, ObjectId, RootId, RootTree, StoreError, Tree,
    TreeEntry,
};
use crate::path::RelativePath;

/// Predicate over `(path, filter id)` deciding whether a path is visible.
pub trait Filter: Send + Sync {
    /// Returns true if `path` is excluded from the view described by
    /// `filter_id`.
    fn is_path_filtered(&self, path: &RelativePath, filter_id: &str) -> bool;
}

/// A [`BackingStore`] wrapper applying a [`Filter`] to every tree it serves.
///
/// Root ids for this store take the form `<underlying root id>:<filter id>`.
/// Ids handed back out of this store are always wrapped; ids passed down to
/// the underlying store are always unwrapped. A wrapped id must never leak
/// into the underlying store.
pub struct FilteredBackingStore {
    store: Arc<dyn BackingStore>,
    filter: Arc<dyn Filter>,
}

impl FilteredBackingStore {
    pub fn new(store: Arc<dyn BackingStore>, filter: Arc<dyn Filter>) -> FilteredBackingStore {
        FilteredBackingStore { store, filter }
    }

    /// Compose a root id for this store from an underlying root id and a
    /// filter id.
    pub fn create_filtered_root_id(root_id: &RootId, filter_id: &str) -> RootId {
        RootId::new(format!("{}:{}", root_id.value(), filter_id))
    }

    /// Split a composed root id back into `(filter id, underlying root id)`.
    fn parse_filter_id_from_root_id(root_id: &RootId) -> Result<(String, RootId), StoreError> {
        match root_id.value().split_once(':') {
            Some((root, filter)) => Ok((filter.to_string(), RootId::new(root))),
            None => Err(StoreError::MalformedRootId(format!(
                "invalid root id: {}. expected <root id>:<filter id>",
                root_id.value()
            ))),
        }
    }

    /// Whether a path changes visibility between two filters. If the path is
    /// visible in both or hidden in both, the change does not affect it.
    fn path_affected_by_filter_change(
        &self,
        path_one: &RelativePath,
        path_two: &RelativePath,
        filter_one: &str,
        filter_two: &str,
    ) -> bool {
        let one_filtered = self.filter.is_path_filtered(path_one, filter_one);
        let two_filtered = self.filter.is_path_filtered(path_two, filter_two);
        one_filtered != two_filtered
    }

    /// Apply the filter to an unfiltered tree located at `tree_path`,
    /// wrapping the ids of every surviving entry.
    fn filter_tree(&self, unfiltered: &Tree, tree_path: &RelativePath, filter_id: &str) -> Tree {
        let mut entries = Vec::with_capacity(unfiltered.len());
        for (name, entry) in unfiltered.iter() {
            let entry_path = tree_path.join(name);
            if self.filter.is_path_filtered(&entry_path, filter_id) {
                continue;
            }
            let wrapped = if entry.kind.is_tree() {
                FilteredObjectId::tree(&entry_path, filter_id, &entry.id)
            } else {
                FilteredObjectId::blob(&entry.id)
            };
            entries.push((
                name.clone(),
                TreeEntry::new(wrapped.to_object_id(), entry.kind),
            ));
        }
        Tree::new(entries, unfiltered.case_sensitivity())
    }
}

impl BackingStore for FilteredBackingStore {
    fn get_root_tree(&self, root_id: &RootId) -> Result<RootTree, StoreError> {
        let (filter_id, parsed_root) = Self::parse_filter_id_from_root_id(root_id)?;
        let result = self.store.get_root_tree(&parsed_root)?;
        let filtered = self.filter_tree(&result.tree, &RelativePath::new(), &filter_id);
        let root_foid = FilteredObjectId::tree(&RelativePath::new(), &filter_id, &result.tree_id);
        Ok(RootTree {
            tree: Arc::new(filtered),
            tree_id: root_foid.to_object_id(),
        })
    }

    fn get_tree(&self, id: &ObjectId) -> Result<Arc<Tree>, StoreError> {
        let foid = FilteredObjectId::from_object_id(id)?;
        match foid.object_type() {
            FilteredObjectIdType::Tree => {
                let unfiltered = self.store.get_tree(&foid.object())?;
                let tree_path = foid.path()?;
                let filter_id = foid.filter()?.to_string();
                Ok(Arc::new(self.filter_tree(
                    &unfiltered,
                    &tree_path,
                    &filter_id,
                )))
            }
            FilteredObjectIdType::UnfilteredTree => {
                // Nothing under this tree is filterable, but children still
                // have to be wrapped so their ids stay parseable by this
                // layer.
                let unfiltered = self.store.get_tree(&foid.object())?;
                let mut entries = Vec::with_capacity(unfiltered.len());
                for (name, entry) in unfiltered.iter() {
                    let wrapped = if entry.kind.is_tree() {
                        FilteredObjectId::unfiltered_tree(&entry.id)
                    } else {
                        FilteredObjectId::blob(&entry.id)
                    };
                    entries.push((
                        name.clone(),
                        TreeEntry::new(wrapped.to_object_id(), entry.kind),
                    ));
                }
                Ok(Arc::new(Tree::new(entries, unfiltered.case_sensitivity())))
            }
            FilteredObjectIdType::Blob => Err(StoreError::TypeMismatch(format!(
                "get_tree called with blob id {id:?}"
            ))),
        }
    }

    fn get_blob(&self, id: &ObjectId) -> Result<Vec<u8>, StoreError> {
        let foid = FilteredObjectId::from_object_id(id)?;
        self.store.get_blob(&foid.object())
    }

    fn get_blob_metadata(&self, id: &ObjectId) -> Result<BlobMetadata, StoreError> {
        let foid = FilteredObjectId::from_object_id(id)?;
        self.store.get_blob_metadata(&foid.object())
    }

    fn prefetch_blobs(&self, ids: &[ObjectId]) -> Result<(), StoreError> {
        let unwrapped = ids
            .iter()
            .map(|id| FilteredObjectId::from_object_id(id).map(|foid| foid.object()))
            .collect::<Result<Vec<_>, _>>()?;
        self.store.prefetch_blobs(&unwrapped)
    }

    fn compare_objects_by_id(
        &self,
        one: &ObjectId,
        two: &ObjectId,
    ) -> Result<ObjectComparison, StoreError> {
        // Same bytes means same filter and same underlying object.
        if one == two {
            return Ok(ObjectComparison::Identical);
        }

        let foid_one = FilteredObjectId::from_object_id(one)?;
        let foid_two = FilteredObjectId::from_object_id(two)?;
        let type_one = foid_one.object_type();
        let type_two = foid_two.object_type();

        // Comparing objects of different types means the caller is confused.
        if type_one != type_two {
            return Err(StoreError::TypeMismatch(format!(
                "must compare objects of the same type, got {type_one:?} vs {type_two:?}"
            )));
        }

        match type_one {
            FilteredObjectIdType::Blob | FilteredObjectIdType::UnfilteredTree => self
                .store
                .compare_objects_by_id(&foid_one.object(), &foid_two.object()),
            FilteredObjectIdType::Tree => {
                if foid_one.filter()? == foid_two.filter()? {
                    return self
                        .store
                        .compare_objects_by_id(&foid_one.object(), &foid_two.object());
                }

                // Different filters. If the tree's own path changes
                // visibility, the trees render differently. Otherwise defer
                // to the underlying comparison, but a descendant may still be
                // affected by the filter change, so Identical degrades to
                // Unknown.
                let affected = self.path_affected_by_filter_change(
                    &foid_one.path()?,
                    &foid_two.path()?,
                    foid_one.filter()?,
                    foid_two.filter()?,
                );
                if affected {
                    return Ok(ObjectComparison::Different);
                }
                match self
                    .store
                    .compare_objects_by_id(&foid_one.object(), &foid_two.object())?
                {
                    ObjectComparison::Identical => Ok(ObjectComparison::Unknown),
                    other => Ok(other),
                }
            }
        }
    }
}
