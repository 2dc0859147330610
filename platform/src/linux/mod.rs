pub mod device;
pub mod mounts;

pub use device::LinuxDeviceManager;
pub use mounts::LinuxMountTable;
