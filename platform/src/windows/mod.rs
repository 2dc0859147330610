pub mod device;
pub mod elevation;

pub use device::{WindowsDeviceManager, WindowsMountTable};
pub use elevation::is_elevated;
