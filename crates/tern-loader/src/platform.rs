//! Platform linker profile and the dlopen indirection.
//!
//! Two bionic behaviors shape native loading on older Android releases:
//!
//! - Below API 23, the dynamic linker ignores DT_SONAME and identifies
//!   libraries by basename, so two distinct libraries sharing a filename
//!   are conflated. The loader works around this with uniquely named
//!   symlink aliases.
//! - On 64-bit ABIs below API 23, a library loaded by absolute path cannot
//!   have its DT_NEEDED entries resolved against other absolute-path
//!   libraries, and the linker's name field is too short for many absolute
//!   paths. The loader instead injects the library's directory into the
//!   search path and loads by basename.
//!
//! All native loads go through one pluggable [`LinkerHost`]; the host
//! installs it once at startup so that every load, direct or
//! dependency-chain, is routed through it. [`SystemLinker`] is the real
//! implementation; tests substitute a recording fake.

use std::path::Path;

/// First API level with fixed soname/path handling in the dynamic linker.
pub const LINKER_FIX_API_LEVEL: u32 = 23;

/// An opaque handle to a loaded native library.
///
/// Handles are never closed; a loaded library stays resident for the life of
/// the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibHandle(*mut std::ffi::c_void);

// Safety: the handle is an opaque token owned by the platform linker; it is
// only ever passed back to dlopen-family APIs, which are thread-safe.
unsafe impl Send for LibHandle {}
unsafe impl Sync for LibHandle {}

impl LibHandle {
    /// Wrap a raw platform handle.
    pub fn from_raw(ptr: *mut std::ffi::c_void) -> Self {
        Self(ptr)
    }

    /// The raw platform handle.
    pub fn as_ptr(&self) -> *mut std::ffi::c_void {
        self.0
    }
}

/// Version-conditional linker behavior.
#[derive(Debug, Clone, Copy)]
pub struct LinkerProfile {
    /// Platform API level the process is running under.
    pub api_level: u32,
    /// Whether this is a 64-bit build.
    pub pointer_width_64: bool,
}

impl LinkerProfile {
    pub fn new(api_level: u32, pointer_width_64: bool) -> Self {
        Self {
            api_level,
            pointer_width_64,
        }
    }

    /// Profile for the running process at the given API level.
    pub fn current(api_level: u32) -> Self {
        Self::new(api_level, cfg!(target_pointer_width = "64"))
    }

    /// Whether the linker identifies libraries by basename, conflating
    /// distinct libraries that share one.
    pub fn conflates_basenames(&self) -> bool {
        self.api_level < LINKER_FIX_API_LEVEL
    }

    /// Whether loading must go through the search path and a basename
    /// because absolute-path loads break dependency resolution.
    pub fn needs_search_path(&self) -> bool {
        self.conflates_basenames() && self.pointer_width_64
    }
}

/// The host's native-library loading surface.
///
/// The single indirection point by which this system loads binaries; wrapping
/// it once at startup guarantees every load is routed through the dependency
/// loader.
pub trait LinkerHost: Send + Sync {
    /// Load a library. `global` requests global symbol visibility so that
    /// later loads can resolve symbols against it.
    ///
    /// The error string is the platform's own diagnostic.
    fn dlopen(&self, path: &Path, global: bool) -> Result<LibHandle, String>;

    /// Replace the linker's extra search path with the given `:`-separated
    /// directory list.
    fn update_search_path(&self, dirs: &str) -> Result<(), String>;
}

/// [`LinkerHost`] backed by the process's real dynamic linker.
pub struct SystemLinker;

#[cfg(unix)]
impl LinkerHost for SystemLinker {
    fn dlopen(&self, path: &Path, global: bool) -> Result<LibHandle, String> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|e| format!("invalid library path: {e}"))?;
        let visibility = if global {
            libc::RTLD_GLOBAL
        } else {
            libc::RTLD_LOCAL
        };
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | visibility) };
        if handle.is_null() {
            Err(dlerror_string())
        } else {
            Ok(LibHandle::from_raw(handle))
        }
    }

    fn update_search_path(&self, dirs: &str) -> Result<(), String> {
        android_update_ld_library_path(dirs)
    }
}

#[cfg(not(unix))]
impl LinkerHost for SystemLinker {
    fn dlopen(&self, path: &Path, _global: bool) -> Result<LibHandle, String> {
        Err(format!(
            "native loading is not supported on this platform: {}",
            path.display()
        ))
    }

    fn update_search_path(&self, _dirs: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Latest dlerror text, or a placeholder when the linker reports nothing.
#[cfg(unix)]
fn dlerror_string() -> String {
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "unknown linker error".to_string()
        } else {
            std::ffi::CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

/// `android_update_LD_LIBRARY_PATH` is the undocumented libdl entry point the
/// platform itself uses; it is the only way to change the search path of an
/// already-running linker.
#[cfg(all(unix, target_os = "android"))]
fn android_update_ld_library_path(dirs: &str) -> Result<(), String> {
    type UpdateFn = unsafe extern "C" fn(*const libc::c_char);

    let libdl = std::ffi::CString::new("libdl.so").map_err(|e| e.to_string())?;
    let handle = unsafe { libc::dlopen(libdl.as_ptr(), libc::RTLD_NOW) };
    if handle.is_null() {
        return Err(dlerror_string());
    }
    let symbol = std::ffi::CString::new("android_update_LD_LIBRARY_PATH")
        .map_err(|e| e.to_string())?;
    let update = unsafe { libc::dlsym(handle, symbol.as_ptr()) };
    if update.is_null() {
        return Err(dlerror_string());
    }
    let c_dirs = std::ffi::CString::new(dirs).map_err(|e| e.to_string())?;
    unsafe {
        let update: UpdateFn = std::mem::transmute(update);
        update(c_dirs.as_ptr());
    }
    Ok(())
}

/// Non-Android linkers honor absolute paths; there is nothing to update.
#[cfg(all(unix, not(target_os = "android")))]
fn android_update_ld_library_path(_dirs: &str) -> Result<(), String> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_predicates() {
        let legacy32 = LinkerProfile::new(22, false);
        assert!(legacy32.conflates_basenames());
        assert!(!legacy32.needs_search_path());

        let legacy64 = LinkerProfile::new(22, true);
        assert!(legacy64.conflates_basenames());
        assert!(legacy64.needs_search_path());

        let fixed = LinkerProfile::new(23, true);
        assert!(!fixed.conflates_basenames());
        assert!(!fixed.needs_search_path());
    }

    #[cfg(unix)]
    #[test]
    fn test_system_dlopen_missing_library() {
        let result = SystemLinker.dlopen(Path::new("/nonexistent/libmissing.so"), false);
        assert!(result.is_err());
        assert!(!result.unwrap_err().is_empty());
    }
}
