//! Glob matching and ignore-rule evaluation.
//!
//! [`matcher`] compiles a single gitignore-style pattern into a byte-coded
//! program; [`node`] builds a tree of matchers for walking directory trees;
//! [`ignore`] layers gitignore file semantics (negation, anchoring,
//! directory-only rules) on top of the matcher.

pub mod ignore;
pub mod matcher;
pub mod node;

pub use ignore::{FileType, IgnoreFile, IgnorePattern, MatchResult};
pub use matcher::{GlobError, GlobMatcher, GlobOptions};
pub use node::{GlobResult, GlobTree, PREFETCH_BATCH_SIZE, prefetch_blobs};
