//! Native-library loading with dependency pre-loading.
//!
//! Loading an extracted shared object is more than one dlopen on legacy
//! Android: its DT_NEEDED entries must be satisfied first (the platform
//! linker will not find bundle libraries on its own), basename collisions
//! need uniquely named aliases, and on legacy 64-bit builds the load itself
//! must go through the search path by basename. The whole sequence for one
//! binary (alias assignment, the dependency walk, the platform load call)
//! runs under a single process-wide lock; native loads are rare enough that
//! serializing them is the right trade for correct shared bookkeeping.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use tern_archive::ArchiveError;

use crate::elf;
use crate::error::LoadError;
use crate::platform::{LibHandle, LinkerHost, LinkerProfile};
use crate::resolver::Resolver;

/// Extra host configuration for native loading.
#[derive(Debug, Clone, Default)]
pub struct NativeConfig {
    /// Platform-supplied native library directories (e.g. the app's own lib
    /// dir), appended to the injected search path on legacy 64-bit builds.
    pub system_lib_dirs: Vec<PathBuf>,
}

/// Process-wide native-load bookkeeping.
///
/// Lives for the whole process; the embedder constructs one and hands it to
/// the [`NativeLoader`], which keeps it behind a single lock.
#[derive(Debug, Default)]
pub struct LoadState {
    /// Required-library name → handle, or None for "known absent" (possibly
    /// satisfied by the platform at load time).
    loaded: HashMap<String, Option<LibHandle>>,
    /// On-disk load name → the real extracted path that owns it, for
    /// basename-collision detection.
    basenames: HashMap<String, PathBuf>,
}

impl LoadState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record libraries that were already loaded before this state existed
    /// (e.g. by the host's startup code), so later loads detect collisions
    /// with their basenames.
    pub fn seed_basenames<I>(&mut self, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        for path in paths {
            if let Some(name) = file_name(&path) {
                self.basenames.entry(name).or_insert(path);
            }
        }
    }

    /// Whether a dependency name has been decided (loaded or known absent).
    pub fn is_decided(&self, soname: &str) -> bool {
        self.loaded.contains_key(soname)
    }
}

/// Loads native binaries from an overlay, satisfying their dependency
/// chains first.
pub struct NativeLoader<H: LinkerHost> {
    host: H,
    profile: LinkerProfile,
    config: NativeConfig,
    state: Mutex<LoadState>,
}

impl<H: LinkerHost> NativeLoader<H> {
    pub fn new(host: H, profile: LinkerProfile, config: NativeConfig, state: LoadState) -> Self {
        Self {
            host,
            profile,
            config,
            state: Mutex::new(state),
        }
    }

    /// The linker host behind this loader.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// The host's entry point for loading a native binary, replacing the
    /// platform's default load-by-path routine.
    ///
    /// `path` may be a bundle-internal path or a local path under the
    /// resolver's extraction root. The binary is materialized, aliased if
    /// its basename collides under the active profile, its declared
    /// dependencies are loaded (or conclusively marked absent), and only
    /// then is it handed to the platform linker.
    pub fn load(&self, resolver: &Resolver, path: &Path) -> Result<LibHandle, LoadError> {
        let zip_path = self.bundle_path(resolver, path)?;
        let mut state = self.state.lock();
        self.load_locked(&mut state, resolver, &zip_path, false)
    }

    /// Locate `lib<name>.so` in the overlay's library directory and return
    /// the name to load it by, or None so the caller can fall back to the
    /// platform's own search.
    pub fn find_library(&self, resolver: &Resolver, name: &str) -> Option<PathBuf> {
        let filename = format!("lib{name}.so");
        let real = match resolver.overlay().extract_lib(&filename) {
            Ok(path) => path,
            Err(e) => {
                if !e.is_not_found() {
                    log::warn!("extracting {filename}: {e}");
                }
                return None;
            }
        };
        let mut state = self.state.lock();
        self.alias_for(&mut state, &real).ok()
    }

    /// Map an incoming path onto a bundle-internal one.
    fn bundle_path(&self, resolver: &Resolver, path: &Path) -> Result<String, LoadError> {
        if let Some(zip_path) = resolver.overlay().zip_path(path) {
            return Ok(zip_path);
        }
        if path.is_relative() {
            return Ok(path.to_string_lossy().replace('\\', "/"));
        }
        Err(LoadError::ForeignPath(path.display().to_string()))
    }

    fn load_locked(
        &self,
        state: &mut LoadState,
        resolver: &Resolver,
        zip_path: &str,
        global: bool,
    ) -> Result<LibHandle, LoadError> {
        let overlay = resolver.overlay();
        let real = overlay.materialize(zip_path)?;
        let load_path = self.alias_for(state, &real)?;
        self.load_needed(state, resolver, &real)?;

        let chosen = if self.profile.needs_search_path() {
            let mut dirs = Vec::new();
            if let Some(dir) = load_path.parent() {
                dirs.push(dir.to_string_lossy().into_owned());
            }
            for dir in &self.config.system_lib_dirs {
                dirs.push(dir.to_string_lossy().into_owned());
            }
            let joined = dirs.join(":");
            self.host
                .update_search_path(&joined)
                .map_err(|message| LoadError::LoadFailure {
                    path: load_path.display().to_string(),
                    message,
                })?;
            PathBuf::from(
                file_name(&load_path).unwrap_or_else(|| load_path.to_string_lossy().into_owned()),
            )
        } else {
            load_path.clone()
        };

        log::debug!("dlopen {} (global={global})", chosen.display());
        self.host
            .dlopen(&chosen, global)
            .map_err(|message| LoadError::LoadFailure {
                path: chosen.display().to_string(),
                message,
            })
    }

    /// Pick the on-disk name a binary loads under, working around basename
    /// conflation.
    ///
    /// The first library to claim a basename keeps it; later libraries from
    /// different paths get `name.1`, `name.2`, … backed by atomic symlinks.
    /// A path that already owns an alias reuses it, so repeated loads do not
    /// grow the alias set.
    fn alias_for(&self, state: &mut LoadState, real: &Path) -> Result<PathBuf, LoadError> {
        if !self.profile.conflates_basenames() {
            return Ok(real.to_path_buf());
        }
        let original = file_name(real)
            .ok_or_else(|| LoadError::ForeignPath(real.display().to_string()))?;

        let mut load_name = original.clone();
        let mut counter = 0;
        while state
            .basenames
            .get(&load_name)
            .is_some_and(|owner| owner.as_path() != real)
        {
            counter += 1;
            load_name = format!("{original}.{counter}");
        }
        state.basenames.insert(load_name.clone(), real.to_path_buf());

        if load_name == original {
            return Ok(real.to_path_buf());
        }
        let link = real.with_file_name(&load_name);
        atomic_symlink(Path::new(&original), &link)?;
        log::debug!("aliased {} -> {}", link.display(), real.display());
        Ok(link)
    }

    /// Load (or mark absent) every library the binary declares, depth
    /// first, before the binary itself is loaded. Dependencies get global
    /// symbol visibility so later loads resolve against them.
    fn load_needed(
        &self,
        state: &mut LoadState,
        resolver: &Resolver,
        real: &Path,
    ) -> Result<(), LoadError> {
        let sonames = match elf::needed_libraries(real) {
            Ok(sonames) => sonames,
            Err(e) => {
                // Unreadable dependency info is treated as "none declared".
                log::debug!("no dependency info for {}: {e}", real.display());
                Vec::new()
            }
        };

        for soname in sonames {
            if state.is_decided(&soname) {
                continue;
            }
            let lib_path = format!("lib/{soname}");
            if !resolver.overlay().exists(&lib_path) {
                // Possibly a platform library; if it is truly missing, the
                // platform load call for the dependent will say so.
                log::debug!("dependency {soname} not bundled, deferring to platform");
                state.loaded.insert(soname, None);
                continue;
            }
            // Decide the name up front so a dependency cycle terminates.
            state.loaded.insert(soname.clone(), None);
            match self.load_locked(state, resolver, &lib_path, true) {
                Ok(handle) => {
                    state.loaded.insert(soname, Some(handle));
                }
                Err(LoadError::Archive(ArchiveError::NotFound(_))) => {
                    state.loaded.insert(soname, None);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

/// Create `link` pointing at `target` without ever exposing a half-made
/// link at the final name: symlink to a temporary name, then rename over.
#[cfg(unix)]
fn atomic_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    let dir = link.parent().unwrap_or(Path::new("."));
    let base = link
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut attempt: u32 = 0;
    loop {
        let tmp = dir.join(format!(".{base}.{}.{attempt}", std::process::id()));
        match std::os::unix::fs::symlink(target, &tmp) {
            Ok(()) => {
                std::fs::rename(&tmp, link)?;
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(not(unix))]
fn atomic_symlink(_target: &Path, link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("symlink aliases are not supported here: {}", link.display()),
    ))
}
