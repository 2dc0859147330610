// Read-only raw filesystem access: partition tables, signature detection,
// per-format metadata parsers and directory walkers.

pub mod detection;
pub mod device_reader;
pub mod disk_manager;
pub mod families;
pub mod ops;
pub mod ops_registry;
pub mod utils;

pub use detection::{detect_filesystem, Detection, FilesystemDetector, ProbeSample};
pub use device_reader::{DeviceLocation, DeviceReader};
pub use disk_manager::{read_partition_table, PartitionStyle, PartitionTable, TableEntry};
pub use families::ext::ExtReader;
pub use families::fat::exfat::ExFatReader;
pub use families::fat::FatReader;
pub use families::ntfs::NtfsReader;
pub use ops::{NodeKind, TreeWalker, WalkEntry};
pub use ops_registry::{
    detect, detect_and_parse, has_raw_walker, list_entries, parse_filesystem, probe, read_preview,
};
