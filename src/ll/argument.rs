//! Argument decomposition for kernel operation requests.
//!
//! Helper to decompose a slice of binary data (the bytes following a request
//! header) into multiple data structures: a leading `#[repr(C)]` struct
//! followed by zero or more NUL-terminated strings.

use zerocopy::error::ConvertError;
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// An iterator that can be used to fetch typed arguments from a byte slice.
pub(crate) struct ArgumentIterator<'a> {
    data: &'a [u8],
}

impl<'a> ArgumentIterator<'a> {
    /// Create a new argument iterator for the given byte slice.
    pub(crate) fn new(data: &'a [u8]) -> ArgumentIterator<'a> {
        ArgumentIterator { data }
    }

    /// Returns the size of the remaining data.
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// Fetch a slice of all remaining bytes.
    pub(crate) fn fetch_all(&mut self) -> &'a [u8] {
        let bytes = self.data;
        self.data = &[];
        bytes
    }

    /// Fetch a typed argument. Returns `None` if there's not enough data left.
    pub(crate) fn fetch<T: FromBytes + KnownLayout + Immutable>(&mut self) -> Option<&'a T> {
        match zerocopy::Ref::<_, T>::from_prefix(self.data) {
            Err(ConvertError::Alignment(_)) => {
                // Alignment is under the control of the programmer (request
                // buffers are aligned for the header type and every argument
                // struct shares its alignment), so panic here. Size failures
                // may be caused by insufficient external data and map to None.
                panic!("request argument data unaligned");
            }
            Err(ConvertError::Size(_)) => None,
            Err(ConvertError::Validity(infallible)) => match infallible {},
            Ok((x, rest)) => {
                self.data = rest;
                Some(zerocopy::Ref::<&[u8], T>::into_ref(x))
            }
        }
    }

    /// Fetch a NUL-terminated byte string (can be non-UTF-8). Returns `None`
    /// if there's not enough data left or no terminator could be found.
    pub(crate) fn fetch_bytes(&mut self) -> Option<&'a [u8]> {
        let len = memchr::memchr(0, self.data)?;
        let (out, rest) = self.data.split_at(len);
        self.data = &rest[1..];
        Some(out)
    }
}
