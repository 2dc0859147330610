// Read-only tree walking shared by every raw decoder.
// Each format supplies node lookup and content reads; path resolution,
// paging and the preview contract live here so they behave the same
// everywhere.

use rawscope_core::{
    child_path, split_relative_path, DirectoryEntry, FsTag, ListOptions, Listing, RawscopeError,
    Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
    Symlink,
    /// Devices, FIFOs, sockets: nothing to preview.
    Other,
}

/// A child found while walking a directory.
#[derive(Debug, Clone)]
pub struct WalkEntry<N> {
    pub name: String,
    pub kind: NodeKind,
    pub size: u64,
    pub node: N,
}

/// One slice of a directory in the walker's stable order.
#[derive(Debug, Clone)]
pub struct Page<N> {
    pub entries: Vec<WalkEntry<N>>,
    /// True when entries exist past the returned slice.
    pub more: bool,
}

/// Format-specific half of the raw tree walker.
pub trait TreeWalker {
    type Node: Clone;

    fn fs_type(&self) -> FsTag;

    /// Whether name lookups ignore case (FAT, exFAT, NTFS).
    fn case_insensitive(&self) -> bool;

    fn root(&mut self) -> Result<Self::Node>;

    /// Children of `dir` in a stable order, skipping the first `skip` and
    /// returning at most `take`. "." and ".." are never included.
    fn children(&mut self, dir: &Self::Node, skip: usize, take: usize) -> Result<Page<Self::Node>>;

    /// Content of a file node, at most `limit` bytes from the start.
    fn read_file(&mut self, node: &Self::Node, kind: NodeKind, limit: usize) -> Result<Vec<u8>>;

    fn find_child(&mut self, dir: &Self::Node, name: &str) -> Result<Option<WalkEntry<Self::Node>>> {
        let fold = self.case_insensitive();
        let page = self.children(dir, 0, usize::MAX)?;
        Ok(page.entries.into_iter().find(|e| names_match(&e.name, name, fold)))
    }
}

pub fn names_match(a: &str, b: &str, case_insensitive: bool) -> bool {
    if case_insensitive {
        a == b || a.to_lowercase() == b.to_lowercase()
    } else {
        a == b
    }
}

/// Walk `components` from the root. The root itself resolves to a
/// directory entry with an empty name.
pub fn resolve<W: TreeWalker>(walker: &mut W, components: &[&str]) -> Result<WalkEntry<W::Node>> {
    let mut current = WalkEntry {
        name: String::new(),
        kind: NodeKind::Directory,
        size: 0,
        node: walker.root()?,
    };
    for (depth, component) in components.iter().enumerate() {
        if current.kind != NodeKind::Directory {
            return Err(RawscopeError::NotADirectory(components[..depth].join("/")));
        }
        current = walker
            .find_child(&current.node, component)?
            .ok_or_else(|| RawscopeError::PathNotFound(components[..=depth].join("/")))?;
    }
    Ok(current)
}

pub fn list_directory<W: TreeWalker>(
    walker: &mut W,
    relative_path: &str,
    options: &ListOptions,
) -> Result<Listing> {
    options.validate()?;
    let components = split_relative_path(relative_path)?;
    let dir = resolve(walker, &components)?;
    if dir.kind != NodeKind::Directory {
        return Err(RawscopeError::NotADirectory(components.join("/")));
    }

    let page = walker.children(&dir.node, options.offset, options.limit)?;
    log::debug!(
        "{} listing '{}': {} entries from offset {}{}",
        walker.fs_type(),
        relative_path,
        page.entries.len(),
        options.offset,
        if page.more { " (more)" } else { "" }
    );
    let returned = page.entries.len();
    let entries = page
        .entries
        .into_iter()
        .map(|e| DirectoryEntry {
            path: child_path(&components, &e.name),
            is_dir: e.kind == NodeKind::Directory,
            size: if e.kind == NodeKind::Directory { 0 } else { e.size },
            name: e.name,
        })
        .collect();

    Ok(Listing {
        entries,
        next_offset: page.more.then(|| options.offset + returned),
    })
}

pub fn read_preview<W: TreeWalker>(walker: &mut W, relative_path: &str, limit: usize) -> Result<Vec<u8>> {
    let components = split_relative_path(relative_path)?;
    let target = resolve(walker, &components)?;
    match target.kind {
        NodeKind::File | NodeKind::Symlink => {
            let mut data = walker.read_file(&target.node, target.kind, limit)?;
            data.truncate(limit);
            Ok(data)
        }
        NodeKind::Directory => Err(RawscopeError::NotAFile(format!("{} is a directory", display(&components)))),
        NodeKind::Other => Err(RawscopeError::NotAFile(format!(
            "{} is a special file with no content",
            display(&components)
        ))),
    }
}

fn display(components: &[&str]) -> String {
    if components.is_empty() {
        "/".to_string()
    } else {
        components.join("/")
    }
}

/// Clamp a declared file size against a caller limit.
pub fn preview_len(size: u64, limit: usize) -> usize {
    size.min(limit as u64) as usize
}

/// Position helper for `children` implementations: decides, for each raw
/// entry in stable order, whether it is skipped, kept, or ends the page.
#[derive(Debug)]
pub struct PageCursor {
    skip: usize,
    take: usize,
    seen: usize,
    kept: usize,
    more: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CursorStep {
    Skip,
    Keep,
    Stop,
}

impl PageCursor {
    pub fn new(skip: usize, take: usize) -> Self {
        Self {
            skip,
            take,
            seen: 0,
            kept: 0,
            more: false,
        }
    }

    pub fn step(&mut self) -> CursorStep {
        let index = self.seen;
        self.seen += 1;
        if index < self.skip {
            CursorStep::Skip
        } else if self.kept < self.take {
            self.kept += 1;
            CursorStep::Keep
        } else {
            self.more = true;
            CursorStep::Stop
        }
    }

    pub fn finish<N>(self, entries: Vec<WalkEntry<N>>) -> Page<N> {
        Page {
            entries,
            more: self.more,
        }
    }
}
