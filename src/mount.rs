//! Per-mount state record.
//!
//! Ties together everything one mount needs: where it lives, where its
//! private state directory is, which channel protocol it speaks, how names
//! compare, and which backing store serves its content. The channel and
//! dispatcher mutate the live pieces; on graceful restart the record is
//! converted into a takeover handoff.

use std::path::PathBuf;
use std::sync::Arc;

use crate::CaseSensitivity;
use crate::channel::{FuseChannelOptions, StopData};
use crate::store::BackingStore;
use crate::takeover::{MountHandoff, TakeoverMountProtocol};

/// Which kernel protocol a mount speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountProtocol {
    Fuse,
    Nfs,
}

impl From<MountProtocol> for TakeoverMountProtocol {
    fn from(protocol: MountProtocol) -> TakeoverMountProtocol {
        match protocol {
            MountProtocol::Fuse => TakeoverMountProtocol::Fuse,
            MountProtocol::Nfs => TakeoverMountProtocol::Nfs,
        }
    }
}

/// The per-mount record.
pub struct MountInfo {
    /// Where the checkout is mounted.
    pub mount_path: PathBuf,
    /// The mount's private state directory (overlay, inode tables, logs).
    pub state_directory: PathBuf,
    pub protocol: MountProtocol,
    pub case_sensitivity: CaseSensitivity,
    /// Reject non-UTF-8 names from the kernel.
    pub require_utf8_paths: bool,
    /// Content source for this mount, usually a filtered stack.
    pub backing_store: Arc<dyn BackingStore>,
}

impl MountInfo {
    /// Channel construction parameters derived from this mount's settings.
    pub fn channel_options(&self) -> FuseChannelOptions {
        let mut options = FuseChannelOptions::new(self.mount_path.clone());
        options.case_sensitivity = self.case_sensitivity;
        options.require_utf8_paths = self.require_utf8_paths;
        options
    }

    /// Package this mount for a takeover message, consuming the stopped
    /// channel's device. The inode-map snapshot comes from the inode layer.
    pub fn into_handoff(self, stop: StopData, inode_map: Vec<u8>) -> MountHandoff {
        MountHandoff {
            mount_path: self.mount_path,
            state_directory: self.state_directory,
            protocol: self.protocol.into(),
            connection_info: stop.connection_info,
            inode_map,
            channel_fd: stop.device,
        }
    }
}

impl std::fmt::Debug for MountInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountInfo")
            .field("mount_path", &self.mount_path)
            .field("state_directory", &self.state_directory)
            .field("protocol", &self.protocol)
            .field("case_sensitivity", &self.case_sensitivity)
            .field("require_utf8_paths", &self.require_utf8_paths)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StopReason;
    use crate::store::fake::FakeBackingStore;

    fn sample_mount() -> MountInfo {
        MountInfo {
            mount_path: PathBuf::from("/mnt/repo"),
            state_directory: PathBuf::from("/home/user/.veilfs/clients/repo"),
            protocol: MountProtocol::Fuse,
            case_sensitivity: CaseSensitivity::Insensitive,
            require_utf8_paths: false,
            backing_store: Arc::new(FakeBackingStore::new()),
        }
    }

    #[test]
    fn channel_options_inherit_mount_settings() {
        let mount = sample_mount();
        let options = mount.channel_options();
        assert_eq!(options.mount_path, PathBuf::from("/mnt/repo"));
        assert_eq!(options.case_sensitivity, CaseSensitivity::Insensitive);
        assert!(!options.require_utf8_paths);
    }

    #[test]
    fn handoff_carries_connection_state() {
        let mount = sample_mount();
        let stop = StopData {
            reason: StopReason::Takeover,
            device: None,
            connection_info: None,
        };
        let handoff = mount.into_handoff(stop, vec![9, 9, 9]);
        assert_eq!(handoff.protocol, TakeoverMountProtocol::Fuse);
        assert_eq!(handoff.inode_map, vec![9, 9, 9]);
        assert_eq!(handoff.mount_path, PathBuf::from("/mnt/repo"));
    }
}
