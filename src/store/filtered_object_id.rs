//! Wrapped object ids used by the filtered backing store.
//!
//! A filtered store must keep objects rendered under different filters
//! distinguishable even when the underlying objects are identical, so the
//! wrapper encodes the filter context into the id itself:
//!
//! - filtered blob:     `0x10 || object`
//! - filtered tree:     `0x11 || varint(filter_len) || filter || varint(path_len) || path || object`
//! - unfiltered tree:   `0x12 || object`
//!
//! The unfiltered-tree variant is an optimization for trees known to contain
//! nothing filterable; it avoids carrying the filter id and path.
//! Varints are unsigned LEB128.

use super::{ObjectId, StoreError};
use crate::path::RelativePath;

/// Type tag stored in the first byte of a wrapped id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FilteredObjectIdType {
    Blob = 0x10,
    Tree = 0x11,
    UnfilteredTree = 0x12,
}

impl FilteredObjectIdType {
    fn from_byte(byte: u8) -> Result<FilteredObjectIdType, StoreError> {
        match byte {
            0x10 => Ok(FilteredObjectIdType::Blob),
            0x11 => Ok(FilteredObjectIdType::Tree),
            0x12 => Ok(FilteredObjectIdType::UnfilteredTree),
            other => Err(StoreError::MalformedId(format!(
                "invalid filtered object id type byte {other:#04x}"
            ))),
        }
    }
}

/// A validated wrapped object id.
///
/// Equality is bytewise: two wrapped ids with different filter ids compare
/// unequal even if they resolve to the same underlying object. Whether they
/// are equivalent is the filtered store's call, not this type's.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilteredObjectId(Vec<u8>);

impl FilteredObjectId {
    /// Wrap a blob id.
    pub fn blob(object: &ObjectId) -> FilteredObjectId {
        let mut buf = Vec::with_capacity(1 + object.as_bytes().len());
        buf.push(FilteredObjectIdType::Blob as u8);
        buf.extend_from_slice(object.as_bytes());
        FilteredObjectId(buf)
    }

    /// Wrap a tree id together with the filter it was rendered under and the
    /// path the tree lives at.
    pub fn tree(path: &RelativePath, filter_id: &str, object: &ObjectId) -> FilteredObjectId {
        let path_bytes = path.as_bytes();
        let filter_bytes = filter_id.as_bytes();
        let mut buf = Vec::with_capacity(
            1 + 5 + filter_bytes.len() + 5 + path_bytes.len() + object.as_bytes().len(),
        );
        buf.push(FilteredObjectIdType::Tree as u8);
        encode_varint(filter_bytes.len() as u64, &mut buf);
        buf.extend_from_slice(filter_bytes);
        encode_varint(path_bytes.len() as u64, &mut buf);
        buf.extend_from_slice(path_bytes);
        buf.extend_from_slice(object.as_bytes());
        FilteredObjectId(buf)
    }

    /// Wrap a tree id known to be unaffected by any filter.
    pub fn unfiltered_tree(object: &ObjectId) -> FilteredObjectId {
        let mut buf = Vec::with_capacity(1 + object.as_bytes().len());
        buf.push(FilteredObjectIdType::UnfilteredTree as u8);
        buf.extend_from_slice(object.as_bytes());
        FilteredObjectId(buf)
    }

    /// Parse and validate a wrapped id from a plain [`ObjectId`].
    pub fn from_object_id(id: &ObjectId) -> Result<FilteredObjectId, StoreError> {
        let bytes = id.as_bytes();
        let Some((&type_byte, rest)) = bytes.split_first() else {
            return Err(StoreError::MalformedId(
                "empty filtered object id".to_string(),
            ));
        };
        match FilteredObjectIdType::from_byte(type_byte)? {
            // The wrapped ObjectId itself cannot be validated; any byte
            // sequence is a legal object id.
            FilteredObjectIdType::Blob | FilteredObjectIdType::UnfilteredTree => {}
            FilteredObjectIdType::Tree => {
                // For trees the varints describing the filter id and path
                // must decode and fit.
                let mut cursor = rest;
                let filter_len = decode_varint(&mut cursor)? as usize;
                if cursor.len() < filter_len {
                    return Err(StoreError::MalformedId(format!(
                        "filter id length {filter_len} overruns id of {} bytes",
                        bytes.len()
                    )));
                }
                cursor = &cursor[filter_len..];
                let path_len = decode_varint(&mut cursor)? as usize;
                if cursor.len() < path_len {
                    return Err(StoreError::MalformedId(format!(
                        "path length {path_len} overruns id of {} bytes",
                        bytes.len()
                    )));
                }
            }
        }
        Ok(FilteredObjectId(bytes.to_vec()))
    }

    /// Render back into a plain [`ObjectId`] for storage in trees.
    pub fn to_object_id(&self) -> ObjectId {
        ObjectId::from_bytes(self.0.clone())
    }

    pub fn object_type(&self) -> FilteredObjectIdType {
        // Validated at construction.
        FilteredObjectIdType::from_byte(self.0[0]).expect("validated on construction")
    }

    /// The underlying object id, for any variant.
    pub fn object(&self) -> ObjectId {
        let rest = &self.0[1..];
        match self.object_type() {
            FilteredObjectIdType::Blob | FilteredObjectIdType::UnfilteredTree => {
                ObjectId::from_bytes(rest)
            }
            FilteredObjectIdType::Tree => {
                let mut cursor = rest;
                let filter_len = decode_varint(&mut cursor).expect("validated on construction");
                cursor = &cursor[filter_len as usize..];
                let path_len = decode_varint(&mut cursor).expect("validated on construction");
                ObjectId::from_bytes(&cursor[path_len as usize..])
            }
        }
    }

    /// The filter id. Fails for blob and unfiltered-tree variants, whose
    /// filter is unknown.
    pub fn filter(&self) -> Result<&str, StoreError> {
        if self.object_type() != FilteredObjectIdType::Tree {
            return Err(StoreError::TypeMismatch(format!(
                "cannot determine filter for non-tree filtered object id {}",
                self.to_object_id()
            )));
        }
        let mut cursor = &self.0[1..];
        let filter_len = decode_varint(&mut cursor)? as usize;
        std::str::from_utf8(&cursor[..filter_len])
            .map_err(|_| StoreError::MalformedId("filter id is not UTF-8".to_string()))
    }

    /// The path the tree lives at. Fails for blob and unfiltered-tree
    /// variants.
    pub fn path(&self) -> Result<RelativePath, StoreError> {
        if self.object_type() != FilteredObjectIdType::Tree {
            return Err(StoreError::TypeMismatch(format!(
                "cannot determine path of non-tree filtered object id {}",
                self.to_object_id()
            )));
        }
        let mut cursor = &self.0[1..];
        let filter_len = decode_varint(&mut cursor)? as usize;
        cursor = &cursor[filter_len..];
        let path_len = decode_varint(&mut cursor)? as usize;
        // Built from a known-good RelativePath, so no re-validation on the
        // way out.
        RelativePath::from_bytes(&cursor[..path_len])
            .map_err(|err| StoreError::MalformedId(err.to_string()))
    }
}

impl std::fmt::Debug for FilteredObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FilteredObjectId({})", self.to_object_id())
    }
}

fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn decode_varint(cursor: &mut &[u8]) -> Result<u64, StoreError> {
    let mut value = 0u64;
    for shift in 0..10 {
        let Some((&byte, rest)) = cursor.split_first() else {
            return Err(StoreError::MalformedId(
                "truncated varint in filtered object id".to_string(),
            ));
        };
        *cursor = rest;
        value |= u64::from(byte & 0x7f) << (shift * 7);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(StoreError::MalformedId(
        "varint in filtered object id exceeds 64 bits".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object() -> ObjectId {
        ObjectId::from_bytes(b"0123456789abcdef0123".to_vec())
    }

    #[test]
    fn blob_round_trip() {
        let foid = FilteredObjectId::blob(&object());
        assert_eq!(foid.object_type(), FilteredObjectIdType::Blob);
        assert_eq!(foid.to_object_id().as_bytes()[0], 0x10);
        assert_eq!(foid.object(), object());

        let parsed = FilteredObjectId::from_object_id(&foid.to_object_id()).unwrap();
        assert_eq!(parsed, foid);
    }

    #[test]
    fn tree_round_trip() {
        let path = RelativePath::from("foo/bar");
        let foid = FilteredObjectId::tree(&path, "filter-v1", &object());
        assert_eq!(foid.object_type(), FilteredObjectIdType::Tree);
        assert_eq!(foid.to_object_id().as_bytes()[0], 0x11);
        assert_eq!(foid.filter().unwrap(), "filter-v1");
        assert_eq!(foid.path().unwrap(), path);
        assert_eq!(foid.object(), object());

        let parsed = FilteredObjectId::from_object_id(&foid.to_object_id()).unwrap();
        assert_eq!(parsed, foid);
    }

    #[test]
    fn unfiltered_tree_round_trip() {
        let foid = FilteredObjectId::unfiltered_tree(&object());
        assert_eq!(foid.object_type(), FilteredObjectIdType::UnfilteredTree);
        assert_eq!(foid.to_object_id().as_bytes()[0], 0x12);
        assert_eq!(foid.object(), object());
        assert!(FilteredObjectId::from_object_id(&foid.to_object_id()).is_ok());
    }

    #[test]
    fn accessors_fail_on_wrong_variant() {
        let blob = FilteredObjectId::blob(&object());
        assert!(blob.filter().is_err());
        assert!(blob.path().is_err());
        let unfiltered = FilteredObjectId::unfiltered_tree(&object());
        assert!(unfiltered.filter().is_err());
        assert!(unfiltered.path().is_err());
    }

    #[test]
    fn invalid_type_byte_rejected() {
        let id = ObjectId::from_bytes(vec![0x42, 1, 2, 3]);
        assert!(FilteredObjectId::from_object_id(&id).is_err());
        assert!(FilteredObjectId::from_object_id(&ObjectId::from_bytes(vec![])).is_err());
    }

    #[test]
    fn truncated_tree_encoding_rejected() {
        // Claims a 200-byte filter id with only a few bytes present.
        let id = ObjectId::from_bytes(vec![0x11, 200, 1, 2]);
        assert!(FilteredObjectId::from_object_id(&id).is_err());
    }

    #[test]
    fn long_filter_id_uses_multi_byte_varint() {
        let filter = "f".repeat(300);
        let foid = FilteredObjectId::tree(&RelativePath::new(), &filter, &object());
        assert_eq!(foid.filter().unwrap(), filter);
        assert_eq!(foid.path().unwrap(), RelativePath::new());
        assert_eq!(foid.object(), object());
    }

    #[test]
    fn equality_is_bytewise() {
        let path = RelativePath::from("a");
        let one = FilteredObjectId::tree(&path, "f1", &object());
        let two = FilteredObjectId::tree(&path, "f2", &object());
        assert_ne!(one, two);
    }
}
