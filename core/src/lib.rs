pub mod access;
pub mod device;
pub mod entry;
pub mod error;
pub mod filesystem;

pub use access::{plan, AccessPlan, AccessState, MountObservation, ProbeOutcome};
pub use device::{BlockDevice, DeviceManager, DeviceType, MountTable, Partition};
pub use entry::{
    child_path, split_relative_path, DirectoryEntry, ListOptions, Listing, DEFAULT_LIST_LIMIT,
    DEFAULT_PREVIEW_LIMIT,
};
pub use error::{ErrorCategory, ErrorReport, RawscopeError, Result};
pub use filesystem::{FilesystemInfo, FsTag, Platform};
