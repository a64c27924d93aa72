//! Byte-string path types for mount-relative paths.
//!
//! Kernel requests carry raw byte names; whether they must be valid UTF-8 is
//! a per-mount property. These types therefore store plain bytes and offer a
//! UTF-8-checked constructor next to a raw one.

use std::fmt;

/// Error produced when a name fails path validation.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path component is empty")]
    Empty,
    #[error("path component contains a slash: {0:?}")]
    EmbeddedSlash(String),
    #[error("path component contains a NUL byte")]
    EmbeddedNul,
    #[error("\".\" and \"..\" are not valid path components")]
    Dot,
    #[error("path component is not valid UTF-8: {0:?}")]
    NotUtf8(String),
}

/// One directory-entry name. Never empty, never contains `/` or NUL, never
/// `.` or `..`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathComponent(Box<[u8]>);

impl PathComponent {
    /// Validate structure only; the bytes may be any non-UTF-8 sequence.
    ///
    /// This is the "skip sanity check" escape used when the mount does not
    /// demand UTF-8 names.
    pub fn from_bytes(bytes: &[u8]) -> Result<PathComponent, PathError> {
        validate_component(bytes)?;
        Ok(PathComponent(bytes.into()))
    }

    /// Validate structure and require valid UTF-8.
    pub fn from_utf8(bytes: &[u8]) -> Result<PathComponent, PathError> {
        validate_component(bytes)?;
        if std::str::from_utf8(bytes).is_err() {
            return Err(PathError::NotUtf8(
                String::from_utf8_lossy(bytes).into_owned(),
            ));
        }
        Ok(PathComponent(bytes.into()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

fn validate_component(bytes: &[u8]) -> Result<(), PathError> {
    if bytes.is_empty() {
        return Err(PathError::Empty);
    }
    if bytes == b"." || bytes == b".." {
        return Err(PathError::Dot);
    }
    if bytes.contains(&b'/') {
        return Err(PathError::EmbeddedSlash(
            String::from_utf8_lossy(bytes).into_owned(),
        ));
    }
    if bytes.contains(&0) {
        return Err(PathError::EmbeddedNul);
    }
    Ok(())
}

impl fmt::Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        String::from_utf8_lossy(&self.0).fmt(f)
    }
}

impl fmt::Debug for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for PathComponent {
    /// Panics on invalid components; for literals.
    fn from(value: &str) -> Self {
        PathComponent::from_bytes(value.as_bytes()).expect("invalid path component literal")
    }
}

/// A `/`-joined path relative to the mount root. The empty path names the
/// root itself.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelativePath(Vec<u8>);

impl RelativePath {
    pub const ROOT: RelativePath = RelativePath(Vec::new());

    pub fn new() -> RelativePath {
        RelativePath(Vec::new())
    }

    /// Parse a `/`-joined byte path. Rejects leading, trailing, and repeated
    /// slashes as well as `.`/`..` components.
    pub fn from_bytes(bytes: &[u8]) -> Result<RelativePath, PathError> {
        if bytes.is_empty() {
            return Ok(RelativePath::new());
        }
        for component in bytes.split(|b| *b == b'/') {
            validate_component(component)?;
        }
        Ok(RelativePath(bytes.to_vec()))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Append one component, returning the joined path.
    pub fn join(&self, name: &PathComponent) -> RelativePath {
        let mut out = Vec::with_capacity(self.0.len() + 1 + name.as_bytes().len());
        out.extend_from_slice(&self.0);
        if !out.is_empty() {
            out.push(b'/');
        }
        out.extend_from_slice(name.as_bytes());
        RelativePath(out)
    }

    /// Append another relative path, returning the joined path.
    pub fn concat(&self, other: &RelativePath) -> RelativePath {
        if self.0.is_empty() {
            return other.clone();
        }
        if other.0.is_empty() {
            return self.clone();
        }
        let mut out = Vec::with_capacity(self.0.len() + 1 + other.0.len());
        out.extend_from_slice(&self.0);
        out.push(b'/');
        out.extend_from_slice(&other.0);
        RelativePath(out)
    }

    /// The final component, or `None` for the root path.
    pub fn basename(&self) -> Option<&[u8]> {
        if self.0.is_empty() {
            return None;
        }
        match memchr::memrchr(b'/', &self.0) {
            Some(idx) => Some(&self.0[idx + 1..]),
            None => Some(&self.0),
        }
    }

    pub fn components(&self) -> impl Iterator<Item = &[u8]> {
        self.0.split(|b| *b == b'/').filter(|c| !c.is_empty())
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        String::from_utf8_lossy(&self.0).fmt(f)
    }
}

impl fmt::Debug for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for RelativePath {
    /// Panics on invalid paths; for literals.
    fn from(value: &str) -> Self {
        RelativePath::from_bytes(value.as_bytes()).expect("invalid relative path literal")
    }
}
