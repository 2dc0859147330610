// Access planning: decides how (and whether) a partition can be browsed right now.
// Pure function of what the caller observed; nothing is remembered between calls.

use crate::filesystem::{FsTag, Platform};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessState {
    /// Host OS has it mounted and the mount point can be read.
    MountedAndReadable,
    /// Not mounted, but a raw tree walker exists for the detected format.
    RawCapable,
    /// Neither of the above.
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessPlan {
    pub path: String,
    pub fs_type: Option<FsTag>,
    pub mount_point: Option<PathBuf>,
    pub can_browse_now: bool,
    pub state: AccessState,
    pub needs_elevation: bool,
    pub message: String,
}

/// What a host mount table lookup found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountObservation {
    pub mount_point: PathBuf,
    pub readable: bool,
}

/// Result of the raw signature probe, as seen by the planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Recognized { fs_type: FsTag, raw_walker: bool },
    Damaged { fs_type: Option<FsTag>, reason: String },
    NotRecognized,
    Denied { reason: String },
    Failed { reason: String },
}

impl ProbeOutcome {
    pub fn fs_type(&self) -> Option<FsTag> {
        match self {
            ProbeOutcome::Recognized { fs_type, .. } => Some(*fs_type),
            ProbeOutcome::Damaged { fs_type, .. } => *fs_type,
            _ => None,
        }
    }
}

/// Run the planner state machine.
pub fn plan(
    path: &str,
    probe: &ProbeOutcome,
    mount: Option<&MountObservation>,
    platform: Platform,
) -> AccessPlan {
    let fs_type = probe.fs_type();
    let needs_elevation = matches!(probe, ProbeOutcome::Denied { .. });

    if let Some(observed) = mount.filter(|m| m.readable) {
        let mut message = format!(
            "{} is mounted at {}; browsing through the host mount bridge, raw parsing is only used for metadata",
            path,
            observed.mount_point.display()
        );
        if let ProbeOutcome::Denied { .. } = probe {
            message.push_str(" (raw metadata unavailable without elevated privileges)");
        }
        log::debug!("plan {}: mounted at {}", path, observed.mount_point.display());
        return AccessPlan {
            path: path.to_string(),
            fs_type,
            mount_point: Some(observed.mount_point.clone()),
            can_browse_now: true,
            state: AccessState::MountedAndReadable,
            needs_elevation,
            message,
        };
    }

    let unreadable_mount = mount
        .map(|m| format!(" (mounted at {} but the mount is not readable)", m.mount_point.display()))
        .unwrap_or_default();

    let (state, message) = match probe {
        ProbeOutcome::Recognized { fs_type, raw_walker: true } => (
            AccessState::RawCapable,
            format!(
                "{} on {} is browsed by reading raw sectors through a read-only handle{}",
                fs_type, path, unreadable_mount
            ),
        ),
        ProbeOutcome::Recognized { fs_type, raw_walker: false } => (
            AccessState::Unsupported,
            format!(
                "{} detected on {} but the directory decoder is not yet implemented for {}; {}{}",
                fs_type,
                path,
                fs_type,
                mount_hint(*fs_type, platform),
                unreadable_mount
            ),
        ),
        ProbeOutcome::Damaged { fs_type, reason } => (
            AccessState::Unsupported,
            format!(
                "{} looks like {} but the structure appears corrupted ({}); raw browsing is disabled{}",
                path,
                fs_type.map(|t| t.as_str()).unwrap_or("a known filesystem"),
                reason,
                unreadable_mount
            ),
        ),
        ProbeOutcome::NotRecognized => (
            AccessState::Unsupported,
            format!(
                "no filesystem signature recognized on {}; there is nothing to browse{}",
                path, unreadable_mount
            ),
        ),
        ProbeOutcome::Denied { reason } => (
            AccessState::Unsupported,
            format!(
                "raw access to {} was refused by the OS ({}); re-run with elevated privileges ({}){}",
                path,
                reason,
                elevation_hint(platform),
                unreadable_mount
            ),
        ),
        ProbeOutcome::Failed { reason } => (
            AccessState::Unsupported,
            format!(
                "could not read {} ({}); retry once the device is available{}",
                path, reason, unreadable_mount
            ),
        ),
    };

    log::debug!("plan {}: {:?}", path, state);
    AccessPlan {
        path: path.to_string(),
        fs_type,
        mount_point: None,
        can_browse_now: state == AccessState::RawCapable,
        state,
        needs_elevation,
        message,
    }
}

fn mount_hint(fs_type: FsTag, platform: Platform) -> &'static str {
    match (fs_type, platform) {
        (FsTag::Btrfs | FsTag::Xfs, Platform::Windows | Platform::MacOS | Platform::Other) => {
            "this host has no native driver for it, so only metadata is shown"
        }
        _ => "mount it with the host OS to browse",
    }
}

fn elevation_hint(platform: Platform) -> &'static str {
    match platform {
        Platform::Windows => "run as Administrator",
        _ => "run as root or via sudo",
    }
}
