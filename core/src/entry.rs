use crate::{RawscopeError, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LIST_LIMIT: usize = 1000;
pub const DEFAULT_PREVIEW_LIMIT: usize = 4096;

/// One child of a listed directory.
///
/// `path` is relative to the partition root (or mount point), `/`-separated,
/// without a leading slash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Page selection for a directory listing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListOptions {
    /// Number of entries to skip, counted in the listing's stable order.
    pub offset: usize,
    /// Maximum number of entries to return.
    pub limit: usize,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl ListOptions {
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(RawscopeError::InvalidInput("listing limit must be at least 1".into()));
        }
        Ok(())
    }

    /// Index one past the last entry this page wants.
    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Listing {
    pub entries: Vec<DirectoryEntry>,
    /// Offset to pass for the next page, if more entries remain.
    pub next_offset: Option<usize>,
}

/// Split a partition-relative path into components.
///
/// Empty string and "/" denote the root. Both separators are accepted,
/// "." is dropped and ".." is refused so callers cannot climb out of a
/// mount point.
pub fn split_relative_path(relative_path: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    for part in relative_path.split(|c| c == '/' || c == '\\') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(RawscopeError::InvalidInput(format!(
                    "'..' is not allowed in {}",
                    relative_path
                )))
            }
            other => parts.push(other),
        }
    }
    Ok(parts)
}

/// Join a listed child's name onto its parent's component list.
pub fn child_path(parent: &[&str], name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent.join("/"), name)
    }
}
