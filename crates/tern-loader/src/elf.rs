//! ELF dependency discovery.
//!
//! Reads just enough of a shared object to answer one question: which
//! libraries does it declare in its dynamic section? The walk is section
//! headers → `SHT_DYNAMIC` → `DT_NEEDED` entries → the linked string table.
//! ELF32 and ELF64 are supported in both byte orders. This is not a linker;
//! relocation, symbols, and program headers are out of scope.

use std::path::Path;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const SHT_DYNAMIC: u32 = 6;
const DT_NULL: i64 = 0;
const DT_NEEDED: i64 = 1;

/// Errors from the ELF reader.
///
/// The native loader flattens all of these to "no declared dependencies":
/// some valid binaries have no dynamic section, and a misread of a non-fatal
/// section must not block loading.
#[derive(Debug, thiserror::Error)]
pub enum ElfError {
    /// File smaller than an ELF header
    #[error("file too short for an ELF header")]
    Truncated,

    /// Magic bytes absent
    #[error("not an ELF image")]
    BadMagic,

    /// Neither ELFCLASS32 nor ELFCLASS64
    #[error("unsupported ELF class {0}")]
    UnsupportedClass(u8),

    /// Neither little- nor big-endian encoding
    #[error("unsupported ELF data encoding {0}")]
    UnsupportedEncoding(u8),

    /// Structurally invalid image
    #[error("malformed ELF: {0}")]
    Malformed(&'static str),

    /// File could not be read
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// The shared libraries a binary declares as dependencies, in declaration
/// order. A binary with no dynamic section yields an empty list.
pub fn needed_libraries(path: &Path) -> Result<Vec<String>, ElfError> {
    let data = std::fs::read(path)?;
    parse_needed(&data)
}

/// [`needed_libraries`] over an in-memory image.
pub fn parse_needed(data: &[u8]) -> Result<Vec<String>, ElfError> {
    if data.len() < 0x34 {
        return Err(ElfError::Truncated);
    }
    if data[..4] != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    let class64 = match data[4] {
        1 => false,
        2 => true,
        c => return Err(ElfError::UnsupportedClass(c)),
    };
    let little = match data[5] {
        1 => true,
        2 => false,
        e => return Err(ElfError::UnsupportedEncoding(e)),
    };
    if class64 && data.len() < 0x40 {
        return Err(ElfError::Truncated);
    }
    let r = Reader {
        data,
        little,
        class64,
    };

    // Section-table location in the ELF header.
    let (shoff_at, shentsize_at, shnum_at) = if class64 {
        (0x28, 0x3a, 0x3c)
    } else {
        (0x20, 0x2e, 0x30)
    };
    let shoff = r.word(shoff_at)? as usize;
    let shentsize = r.u16(shentsize_at)? as usize;
    let shnum = r.u16(shnum_at)? as usize;
    if shoff == 0 || shnum == 0 {
        // Stripped of sections entirely: nothing declared.
        return Ok(Vec::new());
    }
    if shentsize == 0 {
        return Err(ElfError::Malformed("zero section header size"));
    }

    // Field offsets within a section header.
    let (type_at, off_at, size_at, link_at, entsize_at) = if class64 {
        (0x04, 0x18, 0x20, 0x28, 0x38)
    } else {
        (0x04, 0x10, 0x14, 0x18, 0x24)
    };

    for i in 0..shnum {
        let sh = shoff + i * shentsize;
        if r.u32(sh + type_at)? != SHT_DYNAMIC {
            continue;
        }

        let dyn_off = r.word(sh + off_at)? as usize;
        let dyn_size = r.word(sh + size_at)? as usize;
        let link = r.u32(sh + link_at)? as usize;
        if link >= shnum {
            return Err(ElfError::Malformed("dynamic section links past the section table"));
        }
        let str_sh = shoff + link * shentsize;
        let str_off = r.word(str_sh + off_at)? as usize;
        let str_size = r.word(str_sh + size_at)? as usize;
        let strtab = r.bytes(str_off, str_size)?;

        let default_entsize = if class64 { 16 } else { 8 };
        let entsize = match r.word(sh + entsize_at)? as usize {
            0 => default_entsize,
            n => n,
        };

        let mut needed = Vec::new();
        let end = dyn_off
            .checked_add(dyn_size)
            .ok_or(ElfError::Malformed("dynamic section overflows"))?;
        let mut off = dyn_off;
        while off + entsize <= end {
            let (tag, value) = if class64 {
                (r.u64(off)? as i64, r.u64(off + 8)?)
            } else {
                (i64::from(r.u32(off)? as i32), u64::from(r.u32(off + 4)?))
            };
            if tag == DT_NULL {
                break;
            }
            if tag == DT_NEEDED {
                needed.push(string_at(strtab, value as usize)?);
            }
            off += entsize;
        }
        return Ok(needed);
    }

    Ok(Vec::new())
}

/// Bounds-checked, endian-aware field access over a raw image.
struct Reader<'a> {
    data: &'a [u8],
    little: bool,
    class64: bool,
}

impl Reader<'_> {
    fn bytes(&self, off: usize, len: usize) -> Result<&[u8], ElfError> {
        let end = off
            .checked_add(len)
            .ok_or(ElfError::Malformed("offset overflows"))?;
        self.data
            .get(off..end)
            .ok_or(ElfError::Malformed("range past end of file"))
    }

    fn u16(&self, off: usize) -> Result<u16, ElfError> {
        let b: [u8; 2] = self.bytes(off, 2)?.try_into().expect("length checked");
        Ok(if self.little {
            u16::from_le_bytes(b)
        } else {
            u16::from_be_bytes(b)
        })
    }

    fn u32(&self, off: usize) -> Result<u32, ElfError> {
        let b: [u8; 4] = self.bytes(off, 4)?.try_into().expect("length checked");
        Ok(if self.little {
            u32::from_le_bytes(b)
        } else {
            u32::from_be_bytes(b)
        })
    }

    fn u64(&self, off: usize) -> Result<u64, ElfError> {
        let b: [u8; 8] = self.bytes(off, 8)?.try_into().expect("length checked");
        Ok(if self.little {
            u64::from_le_bytes(b)
        } else {
            u64::from_be_bytes(b)
        })
    }

    /// Natural word: u32 for ELF32, u64 for ELF64.
    fn word(&self, off: usize) -> Result<u64, ElfError> {
        if self.class64 {
            self.u64(off)
        } else {
            Ok(u64::from(self.u32(off)?))
        }
    }
}

fn string_at(strtab: &[u8], off: usize) -> Result<String, ElfError> {
    let tail = strtab
        .get(off..)
        .ok_or(ElfError::Malformed("string offset past string table"))?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(ElfError::Malformed("unterminated string"))?;
    Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
}
