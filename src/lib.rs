//! VeilFS core: the kernel-channel and lazy-content engine of a virtual
//! filesystem that presents source-control-managed trees as an ordinary
//! working copy, fetching content on demand from a content-addressed
//! backing store.
//!
//! The crate provides, per mount:
//!
//! - a [`channel::FuseChannel`] speaking the kernel driver's binary
//!   protocol: worker pool, per-request timeouts, cache-invalidation queue,
//!   and graceful-restart handover;
//! - a [`dispatch::Dispatcher`] trait the inode layer implements, one typed
//!   method per opcode;
//! - a [`glob`] engine compiling gitignore-style patterns into byte-coded
//!   matchers and walking backing-store trees with them;
//! - a [`store`] stack whose filter layer renders per-filter views of the
//!   same underlying objects while keeping their identities distinct;
//! - the [`takeover`] protocol moving live mounts (open descriptors
//!   included) to a successor process;
//! - the external contracts: TOML [`config`] loading and the
//!   [`privhelper`] wire protocol.
//!
//! The concurrency model is plain OS threads throughout: each channel runs
//! N reading workers, a request pool, one invalidation sender, and one
//! timeout enforcer. No async runtime is involved.

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod glob;
pub mod ll;
pub mod mount;
pub mod path;
pub mod privhelper;
pub mod socket;
pub mod store;
pub mod takeover;
pub mod telemetry;

pub use channel::{FuseChannel, FuseChannelOptions, StopData, StopReason};
pub use dispatch::{DispatchResult, Dispatcher, RequestContext};
pub use ll::{Errno, FileHandle, Generation, InodeNumber, RequestId};
pub use path::{PathComponent, RelativePath};

/// Whether a mount treats names as case-sensitive.
///
/// Insensitive matching folds ASCII only; bytes outside ASCII always
/// compare identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseSensitivity {
    Sensitive,
    Insensitive,
}
