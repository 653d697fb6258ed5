//! Locating separate debug info files, the way gdb does it.
//!
//! For `/usr/bin/ls` with build ID `abcdef1234` and debug link `ls.debug`
//! the candidates are, in order:
//!
//! - `/usr/lib/debug/.build-id/ab/cdef1234.debug`
//! - `/usr/bin/ls.debug`
//! - `/usr/bin/.debug/ls.debug`
//! - `/usr/lib/debug/usr/bin/ls.debug`
//!
//! All paths are as seen by the profiled process and are checked under its
//! root filesystem.

use std::io;
use std::path::{Path, PathBuf};

use log::debug;

use crate::elf::build_id::BuildId;
use crate::elf::container::BinaryContainer;
use crate::error::{Result, SymtabError};

pub const GLOBAL_DEBUG_DIR: &str = "/usr/lib/debug";

const DEBUG_LINK_SECTION: &str = ".gnu_debuglink";
const MINI_DEBUG_INFO_SECTION: &str = ".gnu_debugdata";
// upper bound on the unpacked size of .gnu_debugdata
const MINI_DEBUG_INFO_LIMIT: usize = 64 << 20;

/// Joins a process-visible absolute path onto a root filesystem.
pub fn in_root(root_fs: &Path, path: &Path) -> PathBuf {
    root_fs.join(path.strip_prefix("/").unwrap_or(path))
}

pub struct DebugFileLocator<'a> {
    root_fs: &'a Path,
}

impl<'a> DebugFileLocator<'a> {
    pub fn new(root_fs: &'a Path) -> Self {
        DebugFileLocator { root_fs }
    }

    /// Returns the process-visible path of the debug file for `binary`, if one exists.
    pub fn find(
        &self,
        binary: &Path,
        build_id: &BuildId,
        c: &mut BinaryContainer,
    ) -> Option<PathBuf> {
        self.by_build_id(build_id)
            .or_else(|| self.by_debug_link(binary, c))
    }

    pub fn by_build_id(&self, build_id: &BuildId) -> Option<PathBuf> {
        let id = &build_id.id;
        if id.len() < 3 || !build_id.is_gnu() {
            return None;
        }
        let candidate = PathBuf::from(format!(
            "{}/.build-id/{}/{}.debug",
            GLOBAL_DEBUG_DIR,
            &id[..2],
            &id[2..]
        ));
        self.exists(&candidate).then_some(candidate)
    }

    pub fn by_debug_link(&self, binary: &Path, c: &mut BinaryContainer) -> Option<PathBuf> {
        let link = debug_link(c)?;
        let dir = binary.parent().unwrap_or(Path::new("/"));
        let candidates = [
            dir.join(&link),
            dir.join(".debug").join(&link),
            in_root(Path::new(GLOBAL_DEBUG_DIR), dir).join(&link),
        ];
        candidates
            .into_iter()
            .filter(|p| p != binary)
            .find(|p| self.exists(p))
    }

    fn exists(&self, path: &Path) -> bool {
        let found = in_root(self.root_fs, path).is_file();
        if found {
            debug!("found debug file {}", path.display());
        }
        found
    }
}

/// The file name stored in `.gnu_debuglink`, without the trailing CRC.
pub fn debug_link(c: &mut BinaryContainer) -> Option<String> {
    let section = c.section(DEBUG_LINK_SECTION).ok()??;
    let data = c.section_data(&section).ok()?;
    if data.len() < 6 {
        return None;
    }
    let end = data.iter().position(|&b| b == 0)?;
    let link = String::from_utf8_lossy(&data[..end]).into_owned();
    if link.is_empty() || link.contains('/') {
        return None;
    }
    Some(link)
}

/// Unpacks the xz-compressed ELF stored in `.gnu_debugdata` ("mini debug info").
///
/// Only binaries without a `.symtab` of their own are considered.
pub fn mini_debug_info(c: &mut BinaryContainer) -> Result<Option<BinaryContainer>> {
    if c.section(".symtab")?.is_some() {
        return Ok(None);
    }
    let Some(section) = c.section(MINI_DEBUG_INFO_SECTION)? else {
        return Ok(None);
    };
    let packed = c.section_data(&section)?;
    let elf = unpack_xz(&packed, MINI_DEBUG_INFO_LIMIT)?;
    debug!("unpacked {} bytes of mini debug info from {}", elf.len(), c.name());
    let name = format!("{}[{}]", c.name(), MINI_DEBUG_INFO_SECTION);
    BinaryContainer::from_bytes(name, elf).map(Some)
}

fn unpack_xz(packed: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut out = LimitedWriter {
        buf: Vec::new(),
        limit,
    };
    lzma_rs::xz_decompress(&mut &packed[..], &mut out)
        .map_err(|e| SymtabError::MiniDebugInfo(e.to_string()))?;
    Ok(out.buf)
}

struct LimitedWriter {
    buf: Vec<u8>,
    limit: usize,
}

impl io::Write for LimitedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.len() > self.limit - self.buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unpacked size exceeds {} bytes", self.limit),
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
