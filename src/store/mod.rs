//! Content-addressed object model and the backing-store contract.
//!
//! A backing store is the source of truth for trees and blobs; it may fetch
//! remotely. The store layers compose: the filter wrapper in
//! [`filter`] sits on top of any base store and re-tags object identifiers
//! with filter context.

pub mod filter;
pub mod filtered_object_id;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::sync::Arc;

use crate::CaseSensitivity;
use crate::path::PathComponent;

pub use filter::{Filter, FilteredBackingStore};
pub use filtered_object_id::{FilteredObjectId, FilteredObjectIdType};

/// Variable-length byte string identifying a content-addressed object.
///
/// Equality is bytewise. The first byte is a type tag reserved to
/// disambiguate wrapper encodings (see [`FilteredObjectId`]).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(Vec<u8>);

impl ObjectId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> ObjectId {
        ObjectId(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

/// Identifier of a commit-level root, in the store's rendered form.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RootId(String);

impl RootId {
    pub fn new(value: impl Into<String>) -> RootId {
        RootId(value.into())
    }

    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RootId({})", self.0)
    }
}

/// Kind of a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    RegularFile,
    ExecutableFile,
    Symlink,
    Directory,
}

impl EntryKind {
    pub fn is_tree(self) -> bool {
        self == EntryKind::Directory
    }

    /// The d_type the kernel would report for this entry.
    pub fn dtype(self) -> crate::ll::reply::DirEntryType {
        use crate::ll::reply::DirEntryType;
        match self {
            EntryKind::RegularFile | EntryKind::ExecutableFile => DirEntryType::RegularFile,
            EntryKind::Symlink => DirEntryType::Symlink,
            EntryKind::Directory => DirEntryType::Directory,
        }
    }
}

/// One child of a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub id: ObjectId,
    pub kind: EntryKind,
}

impl TreeEntry {
    pub fn new(id: ObjectId, kind: EntryKind) -> TreeEntry {
        TreeEntry { id, kind }
    }
}

/// Ordered mapping from entry name to [`TreeEntry`].
///
/// Entries are kept sorted by name bytes. Lookup honors the tree's case
/// sensitivity: byte-identical matching when sensitive, ASCII case-fold
/// when insensitive (non-ASCII bytes always compare identically).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    entries: Vec<(PathComponent, TreeEntry)>,
    case_sensitivity: CaseSensitivity,
}

impl Tree {
    pub fn new(
        mut entries: Vec<(PathComponent, TreeEntry)>,
        case_sensitivity: CaseSensitivity,
    ) -> Tree {
        entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        Tree {
            entries,
            case_sensitivity,
        }
    }

    pub fn case_sensitivity(&self) -> CaseSensitivity {
        self.case_sensitivity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(PathComponent, TreeEntry)> {
        self.entries.iter()
    }

    /// Look up an entry by name, honoring case sensitivity.
    pub fn find(&self, name: &[u8]) -> Option<&TreeEntry> {
        match self.case_sensitivity {
            CaseSensitivity::Sensitive => self
                .entries
                .binary_search_by(|(entry_name, _)| entry_name.as_bytes().cmp(name))
                .ok()
                .map(|idx| &self.entries[idx].1),
            CaseSensitivity::Insensitive => self
                .entries
                .iter()
                .find(|(entry_name, _)| entry_name.as_bytes().eq_ignore_ascii_case(name))
                .map(|(_, entry)| entry),
        }
    }
}

/// Result of comparing two object ids for equivalence.
///
/// Equality here is an approximation: `Unknown` is returned whenever the
/// store cannot cheaply determine equivalence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectComparison {
    Identical,
    Different,
    Unknown,
}

/// Size and content hash for a blob, cheaper to fetch than the blob itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadata {
    pub size: u64,
    pub content_hash: Vec<u8>,
}

/// Errors surfaced by backing-store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object {0} not found")]
    NotFound(ObjectId),
    #[error("root {0} not found")]
    RootNotFound(RootId),
    #[error("malformed object id: {0}")]
    MalformedId(String),
    #[error("invalid root id: {0}")]
    MalformedRootId(String),
    #[error("object type mismatch: {0}")]
    TypeMismatch(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A root tree plus the id it was rendered under.
#[derive(Debug, Clone)]
pub struct RootTree {
    pub tree: Arc<Tree>,
    pub tree_id: ObjectId,
}

/// Source of truth for content-addressed trees and blobs.
///
/// Implementations may fetch remotely; calls can block and should be made
/// from contexts that tolerate suspension (request-handler tasks, glob
/// walks), never from the invalidation thread.
pub trait BackingStore: Send + Sync {
    /// Resolve a commit-level root id to its root tree.
    fn get_root_tree(&self, root_id: &RootId) -> Result<RootTree, StoreError>;

    fn get_tree(&self, id: &ObjectId) -> Result<Arc<Tree>, StoreError>;

    fn get_blob(&self, id: &ObjectId) -> Result<Vec<u8>, StoreError>;

    fn get_blob_metadata(&self, id: &ObjectId) -> Result<BlobMetadata, StoreError>;

    /// Hint that the given blobs will be needed soon. Default: no-op.
    fn prefetch_blobs(&self, _ids: &[ObjectId]) -> Result<(), StoreError> {
        Ok(())
    }

    /// Approximate equivalence check by id alone.
    fn compare_objects_by_id(
        &self,
        a: &ObjectId,
        b: &ObjectId,
    ) -> Result<ObjectComparison, StoreError> {
        if a == b {
            Ok(ObjectComparison::Identical)
        } else {
            Ok(ObjectComparison::Unknown)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(byte: u8) -> TreeEntry {
        TreeEntry::new(ObjectId::from_bytes(vec![byte]), EntryKind::RegularFile)
    }

    #[test]
    fn tree_lookup_case_sensitive() {
        let tree = Tree::new(
            vec![
                ("Makefile".into(), entry(1)),
                ("README".into(), entry(2)),
                ("src".into(), entry(3)),
            ],
            CaseSensitivity::Sensitive,
        );
        assert!(tree.find(b"README").is_some());
        assert!(tree.find(b"readme").is_none());
    }

    #[test]
    fn tree_lookup_case_insensitive_folds_ascii() {
        let tree = Tree::new(
            vec![("README".into(), entry(1))],
            CaseSensitivity::Insensitive,
        );
        assert!(tree.find(b"readme").is_some());
        assert!(tree.find(b"ReAdMe").is_some());
        assert!(tree.find(b"other").is_none());
    }

    #[test]
    fn tree_iterates_sorted() {
        let tree = Tree::new(
            vec![
                ("zlib".into(), entry(1)),
                ("abc".into(), entry(2)),
                ("midpoint".into(), entry(3)),
            ],
            CaseSensitivity::Sensitive,
        );
        let names: Vec<_> = tree.iter().map(|(name, _)| name.to_string()).collect();
        assert_eq!(names, ["abc", "midpoint", "zlib"]);
    }

    #[test]
    fn object_id_display_is_hex() {
        let id = ObjectId::from_bytes(vec![0xde, 0xad, 0x01]);
        assert_eq!(id.to_string(), "dead01");
    }
}
