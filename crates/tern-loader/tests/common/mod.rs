//! Shared fixtures: in-memory bundles, synthesized shared objects, and a
//! recording linker host.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tern_loader::platform::{LibHandle, LinkerHost};
use zip::write::SimpleFileOptions;

use tern_archive::{BundleSource, Overlay, VersionStore};

/// Build a zip bundle in memory.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(&mut cursor);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::from_date_and_time(2024, 5, 17, 10, 30, 0).unwrap());
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();
    cursor.into_inner()
}

/// Open an overlay over one in-memory bundle, rooted in `dir`.
pub fn overlay_from(dir: &Path, entries: &[(&str, &[u8])]) -> Overlay {
    overlay_from_bundles(dir, &[("app", entries)])
}

/// Open an overlay over several in-memory bundles, in the given order.
pub fn overlay_from_bundles(dir: &Path, bundles: &[(&str, &[(&str, &[u8])])]) -> Overlay {
    let mut store = VersionStore::load(dir.join("versions.json")).unwrap();
    let sources = bundles
        .iter()
        .map(|(name, entries)| BundleSource {
            name: name.to_string(),
            reader: Box::new(Cursor::new(zip_bytes(entries))) as Box<dyn tern_archive::ByteSource>,
            token: "t1".to_string(),
        })
        .collect();
    Overlay::open(sources, dir.join("root"), &mut store).unwrap()
}

/// A minimal ELF64 shared object declaring the given DT_NEEDED entries.
pub fn elf64(needed: &[&str]) -> Vec<u8> {
    const SHT_DYNAMIC: u32 = 6;
    const SHT_STRTAB: u32 = 3;

    let mut strtab = vec![0u8];
    let mut offsets = Vec::new();
    for name in needed {
        offsets.push(strtab.len() as u64);
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);
    }

    let mut dynamic = Vec::new();
    for off in &offsets {
        dynamic.extend_from_slice(&1u64.to_le_bytes()); // DT_NEEDED
        dynamic.extend_from_slice(&off.to_le_bytes());
    }
    dynamic.extend_from_slice(&0u64.to_le_bytes()); // DT_NULL
    dynamic.extend_from_slice(&0u64.to_le_bytes());

    let dyn_off = 0x40u64;
    let str_off = dyn_off + dynamic.len() as u64;
    let shoff = str_off + strtab.len() as u64;

    let mut image = vec![0u8; 0x40];
    image[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    image[4] = 2; // ELFCLASS64
    image[5] = 1; // little-endian
    image[6] = 1; // EV_CURRENT
    image[0x28..0x30].copy_from_slice(&shoff.to_le_bytes());
    image[0x3a..0x3c].copy_from_slice(&64u16.to_le_bytes());
    image[0x3c..0x3e].copy_from_slice(&3u16.to_le_bytes());

    image.extend_from_slice(&dynamic);
    image.extend_from_slice(&strtab);

    image.extend_from_slice(&[0u8; 64]); // SHN_UNDEF

    let mut sh = [0u8; 64];
    sh[0x04..0x08].copy_from_slice(&SHT_DYNAMIC.to_le_bytes());
    sh[0x18..0x20].copy_from_slice(&dyn_off.to_le_bytes());
    sh[0x20..0x28].copy_from_slice(&(dynamic.len() as u64).to_le_bytes());
    sh[0x28..0x2c].copy_from_slice(&2u32.to_le_bytes());
    sh[0x38..0x40].copy_from_slice(&16u64.to_le_bytes());
    image.extend_from_slice(&sh);

    let mut sh = [0u8; 64];
    sh[0x04..0x08].copy_from_slice(&SHT_STRTAB.to_le_bytes());
    sh[0x18..0x20].copy_from_slice(&str_off.to_le_bytes());
    sh[0x20..0x28].copy_from_slice(&(strtab.len() as u64).to_le_bytes());
    image.extend_from_slice(&sh);

    image
}

/// One recorded dlopen call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlopenCall {
    pub path: PathBuf,
    pub global: bool,
}

/// A [`LinkerHost`] that records calls and hands out fake handles.
#[derive(Default)]
pub struct FakeLinker {
    pub calls: Mutex<Vec<DlopenCall>>,
    pub search_paths: Mutex<Vec<String>>,
    /// Basenames whose dlopen should fail, simulating unloadable binaries.
    pub fail: Vec<String>,
    next_handle: AtomicUsize,
}

impl FakeLinker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(names: &[&str]) -> Self {
        Self {
            fail: names.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn loaded_names(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| {
                c.path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
            .collect()
    }
}

impl LinkerHost for FakeLinker {
    fn dlopen(&self, path: &Path, global: bool) -> Result<LibHandle, String> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.fail.contains(&name) {
            return Err(format!("cannot locate symbol in \"{name}\""));
        }
        let n = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.lock().unwrap().push(DlopenCall {
            path: path.to_path_buf(),
            global,
        });
        Ok(LibHandle::from_raw(n as *mut std::ffi::c_void))
    }

    fn update_search_path(&self, dirs: &str) -> Result<(), String> {
        self.search_paths.lock().unwrap().push(dirs.to_string());
        Ok(())
    }
}
