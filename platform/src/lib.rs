// Host integration: disk enumeration, mount tables, elevation checks and
// the `RawBridge` facade that ties them to the raw readers.

pub mod bridge;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(target_os = "macos")]
pub mod macos;

pub use bridge::RawBridge;

#[cfg(target_os = "linux")]
pub use linux::{LinuxDeviceManager as PlatformDeviceManager, LinuxMountTable as PlatformMountTable};

#[cfg(target_os = "windows")]
pub use self::windows::{WindowsDeviceManager as PlatformDeviceManager, WindowsMountTable as PlatformMountTable};

#[cfg(target_os = "macos")]
pub use macos::{MacOSDeviceManager as PlatformDeviceManager, MacOSMountTable as PlatformMountTable};

/// Whether the current process can open raw devices without being refused
/// for lack of privileges.
pub fn is_elevated() -> bool {
    #[cfg(windows)]
    {
        crate::windows::is_elevated()
    }

    #[cfg(unix)]
    {
        nix::unistd::geteuid().is_root()
    }

    #[cfg(not(any(windows, unix)))]
    {
        false
    }
}
