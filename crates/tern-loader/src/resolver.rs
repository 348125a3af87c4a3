//! Dotted-name resolution over a bundle overlay.
//!
//! A component name like `pkg.codec.fast` maps to candidate paths inside the
//! overlay: the package marker `pkg/codec/fast/mod.<suffix>` first, then the
//! plain file `pkg/codec/fast.<suffix>`, with suffixes tried in the order of
//! the [`Loaders`] table and bundles in overlay order for each candidate. A
//! directory with no loadable unit still resolves, as a namespace candidate
//! contributing only a search path.

use std::collections::HashSet;
use std::path::PathBuf;

use parking_lot::Mutex;

use tern_archive::overlay::join;
use tern_archive::Overlay;

use crate::error::LoadError;

/// File name (minus suffix) that marks a directory as a package.
pub const PACKAGE_MARKER: &str = "mod";

/// Suffix marking distribution-metadata directories; they never form
/// packages and their contents are left in place.
pub const PKG_INFO_SUFFIX: &str = ".pkg-info";

/// How a located unit is turned into a runnable module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Source text, compiled by the host at import time.
    Source,
    /// Precompiled bytecode.
    Bytecode,
    /// Native shared object, loaded through the native loader.
    Native,
}

/// The ordered table of recognized loadable-unit suffixes.
///
/// Order is priority: within one candidate, an earlier suffix beats a later
/// one. The default table prefers source over bytecode over native.
#[derive(Debug, Clone)]
pub struct Loaders {
    entries: Vec<(String, UnitKind)>,
}

impl Loaders {
    /// A custom table, highest priority first.
    pub fn new(entries: Vec<(String, UnitKind)>) -> Self {
        Self { entries }
    }

    /// Suffixes in priority order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, UnitKind)> {
        self.entries.iter().map(|(s, k)| (s.as_str(), *k))
    }

    /// The unit kind a file name maps to, if any.
    pub fn kind_for(&self, filename: &str) -> Option<UnitKind> {
        self.entries
            .iter()
            .find(|(suffix, _)| filename.ends_with(suffix))
            .map(|(_, kind)| *kind)
    }

    /// Whether a file name is a loadable unit.
    pub fn is_unit(&self, filename: &str) -> bool {
        self.kind_for(filename).is_some()
    }
}

impl Default for Loaders {
    fn default() -> Self {
        Self::new(vec![
            (".tn".to_string(), UnitKind::Source),
            (".tnc".to_string(), UnitKind::Bytecode),
            (".so".to_string(), UnitKind::Native),
        ])
    }
}

/// A resolved component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located {
    /// A loadable unit backed by a bundle entry.
    Unit {
        /// How the unit is executed.
        kind: UnitKind,
        /// Position of the owning bundle in overlay order.
        archive: usize,
        /// Bundle-internal path of the unit file.
        zip_path: String,
        /// Whether the unit is a package marker.
        is_package: bool,
    },
    /// A directory with no unit of its own: a possible namespace package
    /// contributing only a search path.
    Namespace {
        /// Local directory the namespace would search.
        dir_path: PathBuf,
    },
}

/// Resolves dotted component names against one overlay.
pub struct Resolver {
    overlay: Overlay,
    loaders: Loaders,
    extracted_packages: Mutex<HashSet<String>>,
}

impl Resolver {
    pub fn new(overlay: Overlay, loaders: Loaders) -> Self {
        Self {
            overlay,
            loaders,
            extracted_packages: Mutex::new(HashSet::new()),
        }
    }

    /// The overlay this resolver searches.
    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    /// The suffix table in use.
    pub fn loaders(&self) -> &Loaders {
        &self.loaders
    }

    /// Resolve a dotted name, given relative to this resolver's root (the
    /// full name for a top-level resolver).
    ///
    /// `Ok(None)` means the name is simply not present; archive corruption
    /// and I/O failures surface as errors, never as a negative result.
    pub fn resolve(&self, dotted: &str) -> Result<Option<Located>, LoadError> {
        let rel = dotted.replace('.', "/");
        let base = join(self.overlay.prefix(), &rel);

        // Packages take priority over plain files.
        for (marker, is_package) in [(Some(PACKAGE_MARKER), true), (None, false)] {
            for (suffix, kind) in self.loaders.iter() {
                let candidate = match marker {
                    Some(marker) => format!("{base}/{marker}{suffix}"),
                    None => format!("{base}{suffix}"),
                };
                if let Some((archive, _meta)) = self.overlay.find(&candidate) {
                    if is_package && kind == UnitKind::Native {
                        self.extract_package_data(&base)?;
                    }
                    log::debug!("resolved '{dotted}' -> {candidate}");
                    return Ok(Some(Located::Unit {
                        kind,
                        archive,
                        zip_path: candidate,
                        is_package,
                    }));
                }
            }
        }

        if self.overlay.is_dir(&base) {
            // Possible namespace package.
            return Ok(Some(Located::Namespace {
                dir_path: self.overlay.local_path(&base),
            }));
        }
        Ok(None)
    }

    /// Materialize a located unit and return its local path.
    pub fn materialize(&self, located: &Located) -> Result<PathBuf, LoadError> {
        match located {
            Located::Unit { zip_path, .. } => Ok(self.overlay.materialize(zip_path)?),
            Located::Namespace { dir_path } => {
                std::fs::create_dir_all(dir_path)?;
                Ok(dir_path.clone())
            }
        }
    }

    /// A resolver for a package one level below this one.
    pub fn descend(&self, name: &str) -> Resolver {
        Resolver::new(self.overlay.sub(name), self.loaders.clone())
    }

    /// Extract every data file under `dir`, leaving loadable units (pulled
    /// lazily on demand) and versioned shared objects (`libX.so.1`, pulled
    /// only if actually needed) in the bundle.
    pub fn extract_data_dir(&self, dir: &str, recursive: bool) -> Result<(), LoadError> {
        let loaders = &self.loaders;
        self.overlay.extract_dir(dir, recursive, &|name| {
            !loaders.is_unit(name) && !is_versioned_lib(name)
        })?;
        Ok(())
    }

    /// One-time data extraction for a native package directory: native code
    /// commonly expects its package directory to be fully on disk at import
    /// time.
    fn extract_package_data(&self, dir: &str) -> Result<(), LoadError> {
        {
            let mut done = self.extracted_packages.lock();
            if !done.insert(dir.to_string()) {
                return Ok(());
            }
        }
        self.extract_data_dir(dir, true)
    }

    /// Prepare the overlay root for module search: extract root-level data
    /// files, then the contents of every top-level directory that is neither
    /// a package nor distribution metadata.
    ///
    /// Run once when the resolver is installed into the host's search chain.
    pub fn prepare(&self) -> Result<(), LoadError> {
        let root = self.overlay.prefix().to_string();
        self.extract_data_dir(&root, false)?;
        for name in self.overlay.list_dir(&root)? {
            let child = join(&root, &name);
            if self.overlay.is_dir(&child)
                && !name.ends_with(PKG_INFO_SUFFIX)
                && !self.is_package_dir(&child)
            {
                self.extract_data_dir(&child, true)?;
            }
        }
        Ok(())
    }

    /// Top-level modules and packages visible to this resolver, as
    /// `(name, is_package)`, sorted by name.
    pub fn iter_modules(&self) -> Result<Vec<(String, bool)>, LoadError> {
        let root = self.overlay.prefix().to_string();
        let mut modules = Vec::new();
        for name in self.overlay.list_dir(&root)? {
            let child = join(&root, &name);
            if self.overlay.is_dir(&child) {
                if self.is_package_dir(&child) {
                    modules.push((name, true));
                }
            } else if let Some(stem) = self.unit_stem(&name) {
                if stem != PACKAGE_MARKER {
                    modules.push((stem.to_string(), false));
                }
            }
        }
        modules.sort();
        modules.dedup();
        Ok(modules)
    }

    fn is_package_dir(&self, dir: &str) -> bool {
        self.loaders
            .iter()
            .any(|(suffix, _)| self.overlay.exists(&format!("{dir}/{PACKAGE_MARKER}{suffix}")))
    }

    fn unit_stem<'n>(&self, filename: &'n str) -> Option<&'n str> {
        self.loaders
            .iter()
            .find(|(suffix, _)| filename.ends_with(*suffix))
            .map(|(suffix, _)| &filename[..filename.len() - suffix.len()])
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("overlay", &self.overlay)
            .finish()
    }
}

/// Versioned shared-object naming convention, e.g. `libquadmath.so.0`.
pub(crate) fn is_versioned_lib(name: &str) -> bool {
    name.starts_with("lib") && name.contains(".so.")
}
