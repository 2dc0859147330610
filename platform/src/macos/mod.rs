pub mod device;

pub use device::{MacOSDeviceManager, MacOSMountTable};
