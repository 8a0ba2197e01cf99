// src/filesystem/tree.rs

//! Arena-allocated snapshot tree with lazily computed content hashes
//!
//! # Design
//!
//! - **Arena Allocation**: entries live in one `Vec` and reference each other
//!   by [`EntryId`]. Parents are links, not owners, so a relative path is
//!   rebuilt by walking parent links from leaf to root.
//!
//! - **Lazy Hashing**: a file's hash is computed from disk the first time it
//!   is asked for and cached in a `OnceLock`. Trees loaded from a persisted
//!   snapshot carry their hashes preloaded and have no root on disk.
//!
//! - **Deterministic Order**: directory children are kept in a `BTreeMap`, so
//!   iteration yields paths in the same order on every platform.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::hash::{self, Hash, HashAlgorithm};
use crate::transaction::journal;

/// Index of an entry in the tree arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(usize);

impl EntryId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
pub enum EntryKind {
    Dir { children: BTreeMap<String, EntryId> },
    File { hash: OnceLock<Hash> },
}

/// A directory or file in the tree
#[derive(Debug)]
pub struct FsEntry {
    name: String,
    parent: Option<EntryId>,
    kind: EntryKind,
}

impl FsEntry {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn parent(&self) -> Option<EntryId> {
        self.parent
    }

    #[inline]
    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Dir { .. })
    }
}

/// One line of a persisted snapshot
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SnapshotRecord {
    Header { algorithm: String },
    Dir { path: String },
    File { path: String, hash: String },
}

/// Snapshot of a directory tree
#[derive(Debug)]
pub struct FsTree {
    root_path: Option<PathBuf>,
    algorithm: HashAlgorithm,
    entries: Vec<FsEntry>,
}

impl FsTree {
    /// Empty tree, not backed by any directory
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            root_path: None,
            algorithm,
            entries: vec![FsEntry {
                name: String::new(),
                parent: None,
                kind: EntryKind::Dir {
                    children: BTreeMap::new(),
                },
            }],
        }
    }

    /// Snapshot everything under `root`; hashes are computed on demand
    pub fn snapshot(root: &Path, algorithm: HashAlgorithm) -> Result<Self> {
        Self::snapshot_excluding(root, algorithm, &[])
    }

    /// Snapshot `root`, skipping the named top-level entries
    pub fn snapshot_excluding(root: &Path, algorithm: HashAlgorithm, exclude: &[&str]) -> Result<Self> {
        let mut tree = Self::new(algorithm);
        tree.root_path = Some(root.to_path_buf());

        let mut ids: HashMap<PathBuf, EntryId> = HashMap::new();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() != 1 || !exclude.iter().any(|x| e.file_name() == std::ffi::OsStr::new(x))
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                match e.into_io_error() {
                    Some(io) => Error::io(path, io),
                    None => Error::Description(format!("filesystem loop at {}", path.display())),
                }
            })?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| Error::Description(format!("{} escapes the snapshot root", entry.path().display())))?
                .to_path_buf();
            let parent = match relative.parent() {
                Some(p) if !p.as_os_str().is_empty() => ids.get(p).copied().unwrap_or(tree.root()),
                _ => tree.root(),
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let id = if entry.file_type().is_dir() {
                tree.insert_dir(parent, &name)?
            } else {
                tree.insert_file(parent, &name, None)?
            };
            ids.insert(relative, id);
        }

        debug!("Snapshot of {}: {} entries", root.display(), tree.len());
        Ok(tree)
    }

    #[inline]
    pub fn root(&self) -> EntryId {
        EntryId(0)
    }

    pub fn root_path(&self) -> Option<&Path> {
        self.root_path.as_deref()
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Number of entries, the root excluded
    pub fn len(&self) -> usize {
        self.entries.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn entry(&self, id: EntryId) -> &FsEntry {
        &self.entries[id.0]
    }

    /// Add a directory under `parent`, returning the existing one if present
    pub fn insert_dir(&mut self, parent: EntryId, name: &str) -> Result<EntryId> {
        if let Some(existing) = self.child(parent, name) {
            if self.entry(existing).is_dir() {
                return Ok(existing);
            }
            return Err(Error::Description(format!(
                "{} exists as a file",
                self.child_path(parent, name)
            )));
        }
        self.insert(
            parent,
            name,
            EntryKind::Dir {
                children: BTreeMap::new(),
            },
        )
    }

    /// Add a file under `parent`, optionally with a known hash
    pub fn insert_file(&mut self, parent: EntryId, name: &str, hash: Option<Hash>) -> Result<EntryId> {
        if self.child(parent, name).is_some() {
            return Err(Error::Description(format!(
                "{} is already in the tree",
                self.child_path(parent, name)
            )));
        }
        let cell = OnceLock::new();
        if let Some(hash) = hash {
            let _ = cell.set(hash);
        }
        self.insert(parent, name, EntryKind::File { hash: cell })
    }

    fn insert(&mut self, parent: EntryId, name: &str, kind: EntryKind) -> Result<EntryId> {
        let id = EntryId(self.entries.len());
        if !self.entry(parent).is_dir() {
            return Err(Error::Description(format!(
                "{} is not a directory",
                self.relative_path(parent)
            )));
        }
        if let EntryKind::Dir { children } = &mut self.entries[parent.0].kind {
            children.insert(name.to_string(), id);
        }
        self.entries.push(FsEntry {
            name: name.to_string(),
            parent: Some(parent),
            kind,
        });
        Ok(id)
    }

    pub fn child(&self, parent: EntryId, name: &str) -> Option<EntryId> {
        match &self.entry(parent).kind {
            EntryKind::Dir { children } => children.get(name).copied(),
            EntryKind::File { .. } => None,
        }
    }

    /// Resolve a `/`-separated relative path
    pub fn lookup(&self, path: &str) -> Option<EntryId> {
        path.split('/')
            .filter(|c| !c.is_empty())
            .try_fold(self.root(), |id, name| self.child(id, name))
    }

    /// `/`-separated path of an entry relative to the tree root
    pub fn relative_path(&self, id: EntryId) -> String {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            let entry = self.entry(cur);
            if entry.parent.is_some() {
                names.push(entry.name.as_str());
            }
            current = entry.parent;
        }
        names.reverse();
        names.join("/")
    }

    fn child_path(&self, parent: EntryId, name: &str) -> String {
        let base = self.relative_path(parent);
        if base.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", base, name)
        }
    }

    /// Every entry below the root with its path, parents before children
    pub fn iter(&self) -> Vec<(String, EntryId)> {
        let mut out = Vec::with_capacity(self.len());
        let mut stack = vec![(String::new(), self.root())];
        while let Some((path, id)) = stack.pop() {
            if id != self.root() {
                out.push((path.clone(), id));
            }
            if let EntryKind::Dir { children } = &self.entry(id).kind {
                for (name, child) in children.iter().rev() {
                    let child_path = if path.is_empty() {
                        name.clone()
                    } else {
                        format!("{}/{}", path, name)
                    };
                    stack.push((child_path, *child));
                }
            }
        }
        out
    }

    /// Content hash of a file entry, computed from disk on first use
    pub fn hash(&self, id: EntryId) -> Result<&Hash> {
        let EntryKind::File { hash } = &self.entry(id).kind else {
            return Err(Error::Description(format!(
                "{} is a directory",
                self.relative_path(id)
            )));
        };
        if let Some(hash) = hash.get() {
            return Ok(hash);
        }
        let Some(root) = &self.root_path else {
            return Err(Error::Description(format!(
                "no recorded hash for {}",
                self.relative_path(id)
            )));
        };
        let computed = hash::hash_file(self.algorithm, &root.join(self.relative_path(id)))?;
        Ok(hash.get_or_init(|| computed))
    }

    /// Hash every file, in parallel
    pub fn compute_hashes(&self) -> Result<()> {
        let files: Vec<EntryId> = self
            .iter()
            .into_iter()
            .filter(|(_, id)| !self.entry(*id).is_dir())
            .map(|(_, id)| id)
            .collect();
        files.par_iter().try_for_each(|id| self.hash(*id).map(|_| ()))
    }

    /// Write the hash-only snapshot to `path`
    pub fn persist(&self, path: &Path) -> Result<()> {
        self.compute_hashes()?;

        let mut content = journal::encode_record(&SnapshotRecord::Header {
            algorithm: self.algorithm.name().to_string(),
        })?;
        for (relative, id) in self.iter() {
            let record = match &self.entry(id).kind {
                EntryKind::Dir { .. } => SnapshotRecord::Dir { path: relative },
                EntryKind::File { .. } => SnapshotRecord::File {
                    hash: self.hash(id)?.to_prefixed_string(),
                    path: relative,
                },
            };
            content.push_str(&journal::encode_record(&record)?);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        crate::transaction::write_atomic(path, content.as_bytes())?;
        debug!("Persisted snapshot of {} entries to {}", self.len(), path.display());
        Ok(())
    }

    /// Read a snapshot written by [`FsTree::persist`]
    ///
    /// Any line failing its checksum makes the whole snapshot unusable.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let corrupted = |line: usize, reason: String| Error::Corrupted {
            path: path.to_path_buf(),
            line,
            reason,
        };

        let mut tree: Option<FsTree> = None;
        for (index, line) in content.lines().enumerate() {
            let line_no = index + 1;
            if line.is_empty() {
                continue;
            }
            let record: SnapshotRecord =
                journal::decode_line(line).map_err(|reason| corrupted(line_no, reason))?;
            if let SnapshotRecord::Header { algorithm } = &record {
                if tree.is_some() {
                    return Err(corrupted(line_no, "duplicate header".to_string()));
                }
                let algorithm: HashAlgorithm = algorithm
                    .parse()
                    .map_err(|e: hash::HashError| corrupted(line_no, e.to_string()))?;
                tree = Some(FsTree::new(algorithm));
                continue;
            }
            let Some(tree) = tree.as_mut() else {
                return Err(corrupted(line_no, "missing header".to_string()));
            };
            match record {
                SnapshotRecord::Header { .. } => {}
                SnapshotRecord::Dir { path: relative } => {
                    let (parent, name) = tree
                        .split_parent(&relative)
                        .ok_or_else(|| corrupted(line_no, format!("orphan entry {}", relative)))?;
                    tree.insert_dir(parent, &name)
                        .map_err(|e| corrupted(line_no, e.to_string()))?;
                }
                SnapshotRecord::File { path: relative, hash } => {
                    let hash = Hash::parse_prefixed(&hash).map_err(|e| corrupted(line_no, e.to_string()))?;
                    let (parent, name) = tree
                        .split_parent(&relative)
                        .ok_or_else(|| corrupted(line_no, format!("orphan entry {}", relative)))?;
                    tree.insert_file(parent, &name, Some(hash))
                        .map_err(|e| corrupted(line_no, e.to_string()))?;
                }
            }
        }

        tree.ok_or_else(|| corrupted(0, "empty snapshot".to_string()))
    }

    fn split_parent(&self, path: &str) -> Option<(EntryId, String)> {
        match path.rsplit_once('/') {
            Some((parent, name)) => Some((self.lookup(parent)?, name.to_string())),
            None => Some((self.root(), path.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn populate(dir: &Path) {
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::create_dir_all(dir.join("conf/empty")).unwrap();
        fs::write(dir.join("bin/run.sh"), b"#!/bin/sh\n").unwrap();
        fs::write(dir.join("conf/app.conf"), b"port=8080\n").unwrap();
        fs::write(dir.join("README"), b"hello").unwrap();
    }

    #[test]
    fn test_snapshot_paths_in_order() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());
        let tree = FsTree::snapshot(temp.path(), HashAlgorithm::Sha256).unwrap();
        let paths: Vec<String> = tree.iter().into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            paths,
            vec!["README", "bin", "bin/run.sh", "conf", "conf/app.conf", "conf/empty"]
        );
        let id = tree.lookup("conf/app.conf").unwrap();
        assert_eq!(tree.relative_path(id), "conf/app.conf");
        assert!(tree.lookup("conf/missing").is_none());
    }

    #[test]
    fn test_snapshot_excluding_top_level() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());
        fs::create_dir_all(temp.path().join(".state")).unwrap();
        fs::write(temp.path().join(".state/index"), b"x").unwrap();
        let tree =
            FsTree::snapshot_excluding(temp.path(), HashAlgorithm::Sha256, &[".state"]).unwrap();
        assert!(tree.lookup(".state").is_none());
        assert!(tree.lookup("README").is_some());
    }

    #[test]
    fn test_lazy_hash_matches_content() {
        let temp = TempDir::new().unwrap();
        populate(temp.path());
        let tree = FsTree::snapshot(temp.path(), HashAlgorithm::Xxh128).unwrap();
        let id = tree.lookup("README").unwrap();
        assert_eq!(
            tree.hash(id).unwrap(),
            &hash::hash_bytes(HashAlgorithm::Xxh128, b"hello")
        );
        assert!(tree.hash(tree.lookup("bin").unwrap()).is_err());
    }

    #[test]
    fn test_persist_and_load() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        populate(&root);
        let tree = FsTree::snapshot(&root, HashAlgorithm::Sha256).unwrap();
        let file = temp.path().join("snapshot");
        tree.persist(&file).unwrap();

        // The live tree can change; the loaded one keeps recorded hashes
        fs::write(root.join("README"), b"changed").unwrap();
        let loaded = FsTree::load(&file).unwrap();
        assert!(loaded.root_path().is_none());
        assert_eq!(loaded.len(), tree.len());
        let id = loaded.lookup("README").unwrap();
        assert_eq!(
            loaded.hash(id).unwrap(),
            &hash::hash_bytes(HashAlgorithm::Sha256, b"hello")
        );
        assert!(loaded.entry(loaded.lookup("conf/empty").unwrap()).is_dir());
    }

    #[test]
    fn test_load_rejects_tampered_line() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        populate(&root);
        let file = temp.path().join("snapshot");
        FsTree::snapshot(&root, HashAlgorithm::Sha256)
            .unwrap()
            .persist(&file)
            .unwrap();

        let content = fs::read_to_string(&file).unwrap();
        fs::write(&file, content.replace("README", "READYOU")).unwrap();
        assert!(matches!(
            FsTree::load(&file),
            Err(Error::Corrupted { line: 2, .. })
        ));
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let mut tree = FsTree::new(HashAlgorithm::Sha256);
        let root = tree.root();
        let dir = tree.insert_dir(root, "a").unwrap();
        assert_eq!(tree.insert_dir(root, "a").unwrap(), dir);
        tree.insert_file(dir, "f", None).unwrap();
        assert!(tree.insert_file(dir, "f", None).is_err());
        let file = tree.lookup("a/f").unwrap();
        assert!(tree.insert_dir(file, "x").is_err());
    }
}
