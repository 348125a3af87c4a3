//! Directory index over one bundle.
//!
//! A [`ZipIndex`] scans every entry of a zip container once at open time and
//! builds two maps: normalized path → entry metadata, and directory path →
//! sorted child names. Many archive tools omit directory entries, so missing
//! intermediate directories are synthesized; the root `""` is always listed,
//! even for an empty bundle.
//!
//! The underlying `ZipArchive` needs `&mut self` for reads, so it sits behind
//! a mutex. The index itself is immutable after open and is consulted without
//! locking, which keeps listing and existence checks cheap under concurrent
//! lookups.

use std::collections::{BTreeSet, HashMap};
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};
use std::{fs, result};

use parking_lot::Mutex;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::cache;
use crate::error::ArchiveError;

type Result<T> = result::Result<T, ArchiveError>;

/// Random-access byte container holding a bundle (an asset stream, an open
/// file, or an in-memory buffer).
pub trait ByteSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> ByteSource for T {}

/// Metadata for one bundle entry.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    /// Entry name exactly as recorded in the container.
    pub(crate) zip_name: String,
    /// Uncompressed size in bytes.
    pub size: u64,
    /// Recorded modification time as Unix seconds.
    pub mtime: u64,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Directory index and reader for one bundle.
pub struct ZipIndex {
    name: String,
    archive: Mutex<ZipArchive<Box<dyn ByteSource>>>,
    entries: HashMap<String, EntryMeta>,
    dir_index: HashMap<String, Vec<String>>,
}

impl ZipIndex {
    /// Open a bundle and build its directory index.
    ///
    /// Fails with [`ArchiveError::Corrupt`] when the container cannot be
    /// parsed.
    pub fn open(name: &str, reader: Box<dyn ByteSource>) -> Result<Self> {
        let corrupt = |e: ZipError| ArchiveError::Corrupt {
            name: name.to_string(),
            message: e.to_string(),
        };
        let mut archive = ZipArchive::new(reader).map_err(corrupt)?;

        let mut entries = HashMap::new();
        let mut dirs: HashMap<String, BTreeSet<String>> = HashMap::new();
        // The root always lists, even when the bundle is empty.
        dirs.insert(String::new(), BTreeSet::new());

        for i in 0..archive.len() {
            let file = archive.by_index(i).map_err(corrupt)?;
            let zip_name = file.name().to_string();
            let normalized = normalize(&zip_name);
            if normalized.is_empty() {
                continue;
            }
            entries.insert(
                normalized.clone(),
                EntryMeta {
                    zip_name,
                    size: file.size(),
                    mtime: cache::zip_mtime(file.last_modified()),
                    is_dir: file.is_dir(),
                },
            );
            if file.is_dir() {
                dirs.entry(normalized.clone()).or_default();
            }

            // Record the entry under its parent, synthesizing intermediate
            // directories that have no explicit entry of their own.
            let mut parts: Vec<&str> = normalized.split('/').collect();
            while !parts.is_empty() {
                let parent = parts[..parts.len() - 1].join("/");
                if let Some(children) = dirs.get_mut(&parent) {
                    children.insert(parts[parts.len() - 1].to_string());
                    break;
                }
                let base = parts.pop().expect("parts is non-empty");
                dirs.insert(parent, BTreeSet::from([base.to_string()]));
            }
        }

        let dir_index = dirs
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().collect()))
            .collect();

        log::debug!("indexed bundle '{}': {} entries", name, entries.len());
        Ok(Self {
            name: name.to_string(),
            archive: Mutex::new(archive),
            entries,
            dir_index,
        })
    }

    /// Bundle name supplied at open time.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `path` exists as a file or directory.
    pub fn exists(&self, path: &str) -> bool {
        let path = normalize(path);
        self.is_dir(&path) || self.entries.contains_key(&path)
    }

    /// Whether `path` is a directory (explicit or synthesized).
    pub fn is_dir(&self, path: &str) -> bool {
        self.dir_index.contains_key(&normalize(path))
    }

    /// Sorted child names of a directory.
    pub fn list_dir(&self, path: &str) -> Result<&[String]> {
        let normalized = normalize(path);
        match self.dir_index.get(&normalized) {
            Some(children) => Ok(children),
            None if self.entries.contains_key(&normalized) => {
                Err(ArchiveError::NotADirectory(normalized))
            }
            None => Err(ArchiveError::NotFound(normalized)),
        }
    }

    /// Metadata for a file or directory entry.
    pub fn metadata(&self, path: &str) -> Option<&EntryMeta> {
        self.entries.get(&normalize(path))
    }

    /// Read an entry's full contents.
    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        let meta = self
            .metadata(path)
            .ok_or_else(|| ArchiveError::NotFound(normalize(path)))?;
        let mut archive = self.archive.lock();
        let mut file = archive
            .by_name(&meta.zip_name)
            .map_err(|e| self.read_error(&meta.zip_name, e))?;
        let mut buf = Vec::with_capacity(meta.size as usize);
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Extract an entry to `root`, mirroring its bundle-internal path.
    ///
    /// The content is written to a temporary name inside the destination
    /// directory and renamed into place, so concurrent extractions of the
    /// same entry either both succeed idempotently or one observes the
    /// other's completed file. Intermediate directories are created as
    /// needed.
    pub fn extract_to(&self, path: &str, root: &Path) -> Result<PathBuf> {
        let normalized = normalize(path);
        let meta = self
            .entries
            .get(&normalized)
            .ok_or_else(|| ArchiveError::NotFound(normalized.clone()))?;
        let out = root.join(&normalized);

        if meta.is_dir {
            fs::create_dir_all(&out)?;
            return Ok(out);
        }

        let out_dir = out.parent().unwrap_or(root);
        fs::create_dir_all(out_dir)?;
        let base = out
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| normalized.clone());

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("{base}."))
            .tempfile_in(out_dir)?;
        {
            let mut archive = self.archive.lock();
            let mut file = archive
                .by_name(&meta.zip_name)
                .map_err(|e| self.read_error(&meta.zip_name, e))?;
            io::copy(&mut file, tmp.as_file_mut())?;
        }
        tmp.persist(&out).map_err(|e| ArchiveError::Io(e.error))?;
        Ok(out)
    }

    /// Extract an entry unless a current copy already exists under `root`.
    ///
    /// Freshness is judged by (size, mtime); the archive mtime is stamped
    /// onto the local file only after the rename, so an interrupted
    /// extraction is re-done on the next call.
    pub fn extract_if_changed(&self, path: &str, root: &Path) -> Result<PathBuf> {
        let normalized = normalize(path);
        let meta = self
            .entries
            .get(&normalized)
            .ok_or_else(|| ArchiveError::NotFound(normalized.clone()))?
            .clone();
        let out = root.join(&normalized);

        if !meta.is_dir {
            if let Ok(stat) = fs::metadata(&out) {
                if cache::is_current(&stat, meta.size, meta.mtime) {
                    return Ok(out);
                }
            }
        }

        let out = self.extract_to(path, root)?;
        if !meta.is_dir {
            cache::stamp_mtime(&out, meta.mtime)?;
            log::trace!("extracted {}:{} -> {}", self.name, normalized, out.display());
        }
        Ok(out)
    }

    fn read_error(&self, zip_name: &str, err: ZipError) -> ArchiveError {
        match err {
            ZipError::FileNotFound => ArchiveError::NotFound(zip_name.to_string()),
            ZipError::Io(e) => ArchiveError::Io(e),
            other => ArchiveError::Corrupt {
                name: self.name.clone(),
                message: other.to_string(),
            },
        }
    }
}

impl std::fmt::Debug for ZipIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipIndex")
            .field("name", &self.name)
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Normalize a bundle-internal path for index lookup.
///
/// Forward slashes only, no leading `./`, no trailing `/`.
pub(crate) fn normalize(path: &str) -> String {
    let mut p = path.replace('\\', "/");
    while let Some(stripped) = p.strip_prefix("./") {
        p = stripped.to_string();
    }
    p.trim_matches('/').to_string()
}
