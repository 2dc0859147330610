// Filesystem families: one module per on-disk format group.
// FAT holds exFAT too since they share cluster-chain concepts.

pub mod btrfs;
pub mod ext;
pub mod fat;
pub mod ntfs;
pub mod xfs;
