//! Cache behavior observable from outside the crate: a current file is
//! never re-read from the bundle, and version changes start from a clean
//! root.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tern_archive::{BundleSource, Overlay, VersionStore};
use zip::write::SimpleFileOptions;

/// Counts every read against the underlying bundle bytes.
struct CountingReader {
    inner: Cursor<Vec<u8>>,
    reads: Arc<AtomicUsize>,
}

impl Read for CountingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(buf)
    }
}

impl Seek for CountingReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
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

fn open_counting(dir: &Path, entries: &[(&str, &[u8])]) -> (Overlay, Arc<AtomicUsize>) {
    let reads = Arc::new(AtomicUsize::new(0));
    let reader = CountingReader {
        inner: Cursor::new(zip_bytes(entries)),
        reads: reads.clone(),
    };
    let mut store = VersionStore::load(dir.join("versions.json")).unwrap();
    let overlay = Overlay::open(
        vec![BundleSource {
            name: "app".to_string(),
            reader: Box::new(reader),
            token: "t1".to_string(),
        }],
        dir.join("root"),
        &mut store,
    )
    .unwrap();
    (overlay, reads)
}

#[test]
fn test_second_materialize_reads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (overlay, reads) = open_counting(dir.path(), &[("pkg/data.bin", &[9u8; 10_000])]);

    let first = overlay.materialize("pkg/data.bin").unwrap();
    assert!(reads.load(Ordering::SeqCst) > 0);
    let content = std::fs::read(&first).unwrap();

    let baseline = reads.load(Ordering::SeqCst);
    let second = overlay.materialize("pkg/data.bin").unwrap();
    assert_eq!(first, second);
    assert_eq!(std::fs::read(&second).unwrap(), content);
    // The freshness check short-circuited: zero bundle reads.
    assert_eq!(reads.load(Ordering::SeqCst), baseline);
}

#[test]
fn test_version_change_leaves_no_stale_files() {
    let dir = tempfile::tempdir().unwrap();

    let entries: &[(&str, &[u8])] = &[
        ("a/one.txt", b"v1 one"),
        ("a/two.txt", b"v1 two"),
        ("b/three.txt", b"v1 three"),
    ];
    let (overlay, _) = open_counting(dir.path(), entries);
    for path in ["a/one.txt", "a/two.txt", "b/three.txt"] {
        overlay.materialize(path).unwrap();
    }
    let root = overlay.extract_root().to_path_buf();
    drop(overlay);

    // Same root, new token, disjoint content.
    let mut store = VersionStore::load(dir.path().join("versions.json")).unwrap();
    let overlay = Overlay::open(
        vec![BundleSource {
            name: "app".to_string(),
            reader: Box::new(Cursor::new(zip_bytes(&[("fresh.txt", b"v2")]))),
            token: "t2".to_string(),
        }],
        dir.path().join("root"),
        &mut store,
    )
    .unwrap();

    let leftover: Vec<_> = walk(&root);
    assert!(leftover.is_empty(), "stale files survived: {leftover:?}");
    overlay.materialize("fresh.txt").unwrap();
    assert_eq!(walk(&root), vec![root.join("fresh.txt")]);
}

fn walk(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(walk(&path));
        } else {
            files.push(path);
        }
    }
    files.sort();
    files
}
