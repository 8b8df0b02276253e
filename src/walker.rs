//! Baseline tree traversal.
//!
//! Yields, for every directory under a root, the immediate entries
//! classified as {dirs, files, links} by `lstat` — symlinks are never
//! resolved, so a dangling symlink is still a link and a symlink to a
//! directory is a link, not a directory. Special files (FIFOs, sockets,
//! devices) are skipped with a warning and excluded from all three lists.

use std::collections::BTreeMap;
use std::fs::FileType;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Immediate children of one directory, by classification.
/// Names are child *names*, not paths; each list is sorted ascending.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirListing {
    pub dirs: Vec<String>,
    pub files: Vec<String>,
    pub links: Vec<String>,
}

impl DirListing {
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.files.is_empty() && self.links.is_empty()
    }
}

/// Entry classification by `lstat`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Link,
    Other,
}

fn classify_file_type(file_type: &FileType) -> EntryKind {
    // Order matters: a symlink's metadata can also report is_dir when
    // followed, but symlink_metadata never follows, so is_symlink wins.
    if file_type.is_symlink() {
        EntryKind::Link
    } else if file_type.is_dir() {
        EntryKind::Dir
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    }
}

/// Classify a single path without resolving symlinks.
/// Returns None when the path does not exist.
pub fn classify(path: impl AsRef<Path>) -> Option<EntryKind> {
    std::fs::symlink_metadata(path.as_ref())
        .ok()
        .map(|meta| classify_file_type(&meta.file_type()))
}

/// Walk the subtree rooted at `root` and return one [`DirListing`] per
/// directory encountered, keyed by the directory's path string.
///
/// The root itself is always present in the result (possibly empty).
pub fn walk_tree(root: &str) -> Result<BTreeMap<String, DirListing>> {
    match classify(root) {
        Some(EntryKind::Dir) => {}
        Some(_) => bail!("Walk root is not a directory: {}", root),
        None => bail!("Walk root does not exist: {}", root),
    }

    let mut tree: BTreeMap<String, DirListing> = BTreeMap::new();
    tree.insert(root.to_string(), DirListing::default());

    for entry in jwalk::WalkDir::new(root).follow_links(false).into_iter() {
        let entry = entry.with_context(|| format!("Directory walk error under {}", root))?;
        if entry.depth() == 0 {
            continue;
        }

        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            tracing::warn!(
                "Skipping non-UTF-8 entry under {}: {:?}",
                root,
                entry.file_name()
            );
            continue;
        };
        let Some(parent) = entry.parent_path().to_str().map(str::to_string) else {
            continue;
        };

        let kind = classify_file_type(&entry.file_type());
        let listing = tree.entry(parent.clone()).or_default();
        match kind {
            EntryKind::Dir => {
                listing.dirs.push(name.clone());
                tree.entry(crate::paths::join(&parent, &name)).or_default();
            }
            EntryKind::File => listing.files.push(name),
            EntryKind::Link => listing.links.push(name),
            EntryKind::Other => {
                tracing::warn!(
                    "Skipping special file (socket/device/fifo): {}",
                    crate::paths::join(&parent, &name)
                );
            }
        }
    }

    for listing in tree.values_mut() {
        listing.dirs.sort();
        listing.files.sort();
        listing.links.sort();
    }

    Ok(tree)
}
