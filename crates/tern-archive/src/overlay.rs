//! Multi-bundle overlay.
//!
//! An app's module root is typically split across bundles: common code in
//! one, platform-specific binaries in another. An [`Overlay`] merges an
//! ordered list of [`ZipIndex`]es over one extraction root: reads take the
//! first match in list order, existence and listings are the union across
//! bundles. All file operations take bundle-internal paths; the name prefix
//! only scopes sub-overlays created as resolution descends into a component.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::ArchiveError;
use crate::index::{normalize, ByteSource, EntryMeta, ZipIndex};
use crate::store::VersionStore;

/// One bundle handed to [`Overlay::open`].
pub struct BundleSource {
    /// Stable bundle name, used as the version-store key.
    pub name: String,
    /// The bundle container bytes.
    pub reader: Box<dyn ByteSource>,
    /// Externally supplied version token (a content hash).
    pub token: String,
}

/// An ordered set of bundles sharing one extraction root.
#[derive(Clone)]
pub struct Overlay {
    archives: Arc<Vec<ZipIndex>>,
    extract_root: Arc<PathBuf>,
    prefix: String,
}

impl Overlay {
    /// Open a root overlay.
    ///
    /// Before any extraction can happen, each source's version token is
    /// compared against the one recorded on a prior run: on any mismatch the
    /// entire extraction root is deleted, so the local cache never mixes
    /// files from two bundle versions. The new tokens are recorded either
    /// way.
    pub fn open(
        sources: Vec<BundleSource>,
        extract_root: impl Into<PathBuf>,
        store: &mut VersionStore,
    ) -> Result<Self, ArchiveError> {
        let extract_root = extract_root.into();

        let changed: Vec<&str> = sources
            .iter()
            .filter(|s| store.get(&s.name) != Some(s.token.as_str()))
            .map(|s| s.name.as_str())
            .collect();
        if !changed.is_empty() && extract_root.exists() {
            log::info!(
                "bundles changed ({}), clearing {}",
                changed.join(", "),
                extract_root.display()
            );
            fs::remove_dir_all(&extract_root)?;
        }
        for source in &sources {
            store.set(&source.name, &source.token);
        }
        store.save()?;
        fs::create_dir_all(&extract_root)?;

        let mut archives = Vec::with_capacity(sources.len());
        for source in sources {
            archives.push(ZipIndex::open(&source.name, source.reader)?);
        }

        Ok(Self {
            archives: Arc::new(archives),
            extract_root: Arc::new(extract_root),
            prefix: String::new(),
        })
    }

    /// A sub-overlay scoped to a component one level below this one.
    ///
    /// Shares the parent's bundles and extraction root; performs no version
    /// check of its own.
    pub fn sub(&self, name: &str) -> Overlay {
        let prefix = if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        };
        Overlay {
            archives: self.archives.clone(),
            extract_root: self.extract_root.clone(),
            prefix,
        }
    }

    /// The name prefix resolution uses for this overlay; empty at the root.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The local directory holding materialized files.
    pub fn extract_root(&self) -> &Path {
        &self.extract_root
    }

    /// The bundles in lookup order.
    pub fn archives(&self) -> &[ZipIndex] {
        &self.archives
    }

    /// Whether any bundle contains `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.archives.iter().any(|a| a.exists(path))
    }

    /// Whether any bundle has a directory at `path`.
    pub fn is_dir(&self, path: &str) -> bool {
        self.archives.iter().any(|a| a.is_dir(path))
    }

    /// Union listing of a directory across all bundles, sorted.
    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, ArchiveError> {
        let mut names: Vec<String> = self
            .archives
            .iter()
            .filter(|a| a.is_dir(path))
            .flat_map(|a| a.list_dir(path).into_iter().flatten().cloned())
            .collect();
        if names.is_empty() && !self.is_dir(path) {
            return Err(if self.exists(path) {
                ArchiveError::NotADirectory(normalize(path))
            } else {
                ArchiveError::NotFound(normalize(path))
            });
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// First bundle containing `path` as a file entry, with its metadata.
    ///
    /// The returned position indexes into [`archives`](Overlay::archives).
    pub fn find(&self, path: &str) -> Option<(usize, EntryMeta)> {
        self.archives
            .iter()
            .enumerate()
            .find_map(|(i, a)| a.metadata(path).map(|m| (i, m.clone())))
    }

    /// Read `path` from the first bundle that contains it.
    pub fn read(&self, path: &str) -> Result<Vec<u8>, ArchiveError> {
        for archive in self.archives.iter() {
            match archive.read(path) {
                Err(ArchiveError::NotFound(_)) => continue,
                other => return other,
            }
        }
        Err(ArchiveError::NotFound(normalize(path)))
    }

    /// Ensure a current copy of `path` exists under the extraction root,
    /// trying bundles in overlay order.
    ///
    /// Returns [`ArchiveError::NotFound`] only when no bundle contains the
    /// path.
    pub fn materialize(&self, path: &str) -> Result<PathBuf, ArchiveError> {
        for archive in self.archives.iter() {
            match archive.extract_if_changed(path, &self.extract_root) {
                Err(ArchiveError::NotFound(_)) => continue,
                other => return other,
            }
        }
        Err(ArchiveError::NotFound(normalize(path)))
    }

    /// Materialize every file under `dir` for which `keep` returns true.
    ///
    /// The walk is the union listing; `keep` receives the file name only.
    /// Callers use the predicate to leave loadable units and versioned
    /// shared objects for on-demand extraction.
    pub fn extract_dir(
        &self,
        dir: &str,
        recursive: bool,
        keep: &dyn Fn(&str) -> bool,
    ) -> Result<(), ArchiveError> {
        for name in self.list_dir(dir)? {
            let child = join(dir, &name);
            if self.is_dir(&child) {
                if recursive {
                    self.extract_dir(&child, true, keep)?;
                }
            } else if keep(&name) {
                self.materialize(&child)?;
            }
        }
        Ok(())
    }

    /// Materialize a shared library from the overlay's `lib/` directory.
    ///
    /// A [`ArchiveError::NotFound`] result may simply mean the library is
    /// supplied by the platform; callers decide whether that is fatal.
    pub fn extract_lib(&self, filename: &str) -> Result<PathBuf, ArchiveError> {
        self.materialize(&format!("lib/{filename}"))
    }

    /// The local path a bundle-internal path materializes to.
    pub fn local_path(&self, path: &str) -> PathBuf {
        self.extract_root.join(normalize(path))
    }

    /// Map a path under the extraction root back to its bundle-internal
    /// path. Returns `None` for paths outside the root.
    pub fn zip_path(&self, local: &Path) -> Option<String> {
        let relative = local.strip_prefix(self.extract_root.as_path()).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                std::path::Component::Normal(part) => {
                    parts.push(part.to_string_lossy().into_owned())
                }
                _ => return None,
            }
        }
        Some(parts.join("/"))
    }
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("bundles", &self.archives.len())
            .field("extract_root", &self.extract_root)
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Join two bundle-internal paths.
pub fn join(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .last_modified_time(
                zip::DateTime::from_date_and_time(2024, 5, 17, 10, 30, 0).unwrap(),
            );
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
        cursor.into_inner()
    }

    fn source(name: &str, token: &str, entries: &[(&str, &[u8])]) -> BundleSource {
        BundleSource {
            name: name.to_string(),
            reader: Box::new(Cursor::new(zip_bytes(entries))),
            token: token.to_string(),
        }
    }

    fn open(dir: &Path, sources: Vec<BundleSource>) -> Overlay {
        let mut store = VersionStore::load(dir.join("versions.json")).unwrap();
        Overlay::open(sources, dir.join("root"), &mut store).unwrap()
    }

    #[test]
    fn test_first_match_wins() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = open(
            dir.path(),
            vec![
                source("app", "t1", &[("a/b.txt", b"from app")]),
                source("reqs", "t2", &[("a/b.txt", b"from reqs"), ("only.txt", b"x")]),
            ],
        );
        assert_eq!(overlay.read("a/b.txt").unwrap(), b"from app");
        assert_eq!(overlay.read("only.txt").unwrap(), b"x");
        assert_eq!(overlay.find("a/b.txt").unwrap().0, 0);
    }

    #[test]
    fn test_union_listing() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = open(
            dir.path(),
            vec![
                source("app", "t1", &[("pkg/a.txt", b"1")]),
                source("reqs", "t2", &[("pkg/b.txt", b"2"), ("pkg/a.txt", b"3")]),
            ],
        );
        assert_eq!(overlay.list_dir("pkg").unwrap(), ["a.txt", "b.txt"]);
        assert!(overlay.is_dir("pkg"));
        assert!(overlay.exists("pkg/b.txt"));
    }

    #[test]
    fn test_version_change_wipes_root() {
        let dir = tempfile::tempdir().unwrap();

        let overlay = open(dir.path(), vec![source("app", "v1", &[("data.txt", b"old")])]);
        let extracted = overlay.materialize("data.txt").unwrap();
        assert!(extracted.exists());
        // A leftover only the wipe would remove.
        fs::write(overlay.extract_root().join("stray.txt"), b"junk").unwrap();
        drop(overlay);

        let overlay = open(dir.path(), vec![source("app", "v2", &[("data.txt", b"new")])]);
        assert!(!overlay.extract_root().join("stray.txt").exists());
        assert!(!overlay.extract_root().join("data.txt").exists());
        assert_eq!(fs::read(overlay.materialize("data.txt").unwrap()).unwrap(), b"new");
    }

    #[test]
    fn test_same_version_preserves_root() {
        let dir = tempfile::tempdir().unwrap();

        let overlay = open(dir.path(), vec![source("app", "v1", &[("data.txt", b"same")])]);
        let first = overlay.materialize("data.txt").unwrap();
        let stamped = fs::metadata(&first).unwrap().modified().unwrap();
        drop(overlay);

        let overlay = open(dir.path(), vec![source("app", "v1", &[("data.txt", b"same")])]);
        let second = overlay.materialize("data.txt").unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::metadata(&second).unwrap().modified().unwrap(), stamped);
    }

    #[test]
    fn test_materialize_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = open(dir.path(), vec![source("app", "t", &[("a.txt", b"1")])]);
        assert!(overlay.materialize("missing.txt").unwrap_err().is_not_found());
    }

    #[test]
    fn test_extract_dir_with_filter() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = open(
            dir.path(),
            vec![source(
                "app",
                "t",
                &[
                    ("pkg/data.txt", b"keep"),
                    ("pkg/code.tn", b"skip"),
                    ("pkg/nested/more.txt", b"keep"),
                ],
            )],
        );
        overlay
            .extract_dir("pkg", true, &|name| !name.ends_with(".tn"))
            .unwrap();
        assert!(overlay.local_path("pkg/data.txt").exists());
        assert!(overlay.local_path("pkg/nested/more.txt").exists());
        assert!(!overlay.local_path("pkg/code.tn").exists());
    }

    #[test]
    fn test_extract_dir_non_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = open(
            dir.path(),
            vec![source(
                "app",
                "t",
                &[("top.txt", b"keep"), ("sub/inner.txt", b"skip")],
            )],
        );
        overlay.extract_dir("", false, &|_| true).unwrap();
        assert!(overlay.local_path("top.txt").exists());
        assert!(!overlay.local_path("sub/inner.txt").exists());
    }

    #[test]
    fn test_sub_overlay_shares_root() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = open(dir.path(), vec![source("app", "t", &[("pkg/x.txt", b"1")])]);
        let sub = overlay.sub("pkg");
        assert_eq!(sub.prefix(), "pkg");
        assert_eq!(sub.extract_root(), overlay.extract_root());
        let nested = sub.sub("inner");
        assert_eq!(nested.prefix(), "pkg/inner");
    }

    #[test]
    fn test_zip_path_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = open(dir.path(), vec![source("app", "t", &[("pkg/x.txt", b"1")])]);
        let local = overlay.local_path("pkg/x.txt");
        assert_eq!(overlay.zip_path(&local).as_deref(), Some("pkg/x.txt"));
        assert_eq!(overlay.zip_path(Path::new("/somewhere/else")), None);
    }

    #[test]
    fn test_extract_lib() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = open(
            dir.path(),
            vec![source("reqs", "t", &[("lib/libdemo.so", b"\x7fELF")])],
        );
        let path = overlay.extract_lib("libdemo.so").unwrap();
        assert_eq!(path, overlay.local_path("lib/libdemo.so"));
        assert!(overlay.extract_lib("libmissing.so").unwrap_err().is_not_found());
    }
}
