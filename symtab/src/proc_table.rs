//! Address space of one process, as described by `/proc/<pid>/maps`.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use log::{debug, warn};
use procfs::process::{MMPermissions, MMapPath, MemoryMap, MemoryMaps, Process};
use procfs_core::{FromBufRead, ProcError};
use serde::Serialize;
use symtab_common::{is_stack_sentinel, Symbol};

use crate::elf::symbols::SymbolOptions;
use crate::elf_cache::{ElfCache, FileIdentity};
use crate::elf_table::{ElfTable, ElfTableDebugInfo, ElfTableOptions};
use crate::error::{Result, SymtabError};
use crate::gcache::Resource;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub shared: bool,
    pub private: bool,
}

impl From<MMPermissions> for Permissions {
    fn from(p: MMPermissions) -> Self {
        Permissions {
            read: p.contains(MMPermissions::READ),
            write: p.contains(MMPermissions::WRITE),
            execute: p.contains(MMPermissions::EXECUTE),
            shared: p.contains(MMPermissions::SHARED),
            private: p.contains(MMPermissions::PRIVATE),
        }
    }
}

/// One line of `/proc/<pid>/maps`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
    pub perms: Permissions,
    pub offset: u64,
    pub file: FileIdentity,
    pub pathname: String,
}

impl MemoryRange {
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    fn is_file_backed(&self) -> bool {
        self.pathname.starts_with('/')
    }
}

impl From<&MemoryMap> for MemoryRange {
    fn from(map: &MemoryMap) -> Self {
        let pathname = match &map.pathname {
            MMapPath::Path(p) => p.to_string_lossy().into_owned(),
            MMapPath::Heap => "[heap]".to_string(),
            MMapPath::Stack => "[stack]".to_string(),
            MMapPath::Vdso => "[vdso]".to_string(),
            MMapPath::Vvar => "[vvar]".to_string(),
            MMapPath::Vsyscall => "[vsyscall]".to_string(),
            MMapPath::Other(s) => s.clone(),
            _ => String::new(),
        };
        MemoryRange {
            start: map.address.0,
            end: map.address.1,
            perms: map.perms.into(),
            offset: map.offset,
            file: FileIdentity {
                device: makedev(map.dev.0 as u32, map.dev.1 as u32),
                inode: map.inode,
            },
            pathname,
        }
    }
}

/// Device number layout used by `stat(2)` on Linux.
pub fn makedev(major: u32, minor: u32) -> u64 {
    let (major, minor) = (major as u64, minor as u64);
    ((major & 0xfffff000) << 32)
        | ((major & 0x00000fff) << 8)
        | ((minor & 0xffffff00) << 12)
        | (minor & 0x000000ff)
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MapFile {
    device: u64,
    inode: u64,
    path: String,
}

impl MapFile {
    fn of(range: &MemoryRange) -> Self {
        MapFile {
            device: range.file.device,
            inode: range.file.inode,
            path: range.pathname.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProcTableOptions {
    pub pid: u32,
    pub root_fs: PathBuf,
    pub symbols: SymbolOptions,
}

impl ProcTableOptions {
    /// Looks binaries up through `/proc/<pid>/root`.
    pub fn new(pid: u32, symbols: SymbolOptions) -> Self {
        ProcTableOptions {
            pid,
            root_fs: PathBuf::from(format!("/proc/{}/root", pid)),
            symbols,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ProcTableDebugInfo {
    pub pid: u32,
    pub ranges: usize,
    pub error: Option<String>,
    pub tables: Vec<ElfTableDebugInfo>,
}

pub struct ProcTable {
    options: ProcTableOptions,
    // executable file-backed ranges sorted by start
    ranges: Vec<(MemoryRange, MapFile)>,
    tables: HashMap<MapFile, ElfTable>,
    error: Option<SymtabError>,
}

impl ProcTable {
    pub fn new(options: ProcTableOptions) -> Self {
        ProcTable {
            options,
            ranges: Vec::new(),
            tables: HashMap::new(),
            error: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.options.pid
    }

    pub fn error(&self) -> Option<&SymtabError> {
        self.error.as_ref()
    }

    pub fn ranges(&self) -> impl Iterator<Item = &MemoryRange> {
        self.ranges.iter().map(|(r, _)| r)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Re-reads the process maps. Once reading fails the table stays failed.
    pub fn refresh(&mut self) {
        if self.error.is_some() {
            return;
        }
        let pid = self.options.pid;
        let maps = Process::new(pid as i32).and_then(|p| p.maps());
        match maps {
            Ok(maps) => self.rebuild(maps),
            Err(e) => {
                let e = maps_error(pid, e);
                if e.is_not_found() {
                    debug!("process {} is gone: {}", pid, e);
                } else {
                    warn!("failed to read maps of {}: {}", pid, e);
                }
                self.error = Some(e);
            }
        }
    }

    /// Rebuilds the ranges from the text of a maps file.
    pub fn refresh_from_maps(&mut self, text: &str) -> Result<()> {
        let maps = MemoryMaps::from_buf_read(text.as_bytes())
            .map_err(|e| maps_error(self.options.pid, e))?;
        self.rebuild(maps);
        Ok(())
    }

    fn rebuild(&mut self, maps: MemoryMaps) {
        let mut ranges = Vec::new();
        let mut tables = HashMap::new();
        for map in maps.iter() {
            let range = MemoryRange::from(map);
            // [vdso] and anonymous JIT code have no file to read symbols from
            if !range.perms.execute || !range.is_file_backed() {
                continue;
            }
            let key = MapFile::of(&range);
            if !tables.contains_key(&key) {
                let table = self.tables.remove(&key).unwrap_or_else(|| {
                    ElfTable::new(&range.pathname, range.start, range.offset, self.elf_options())
                });
                tables.insert(key.clone(), table);
            }
            ranges.push((range, key));
        }
        ranges.sort_by_key(|(r, _)| r.start);

        if !self.tables.is_empty() {
            debug!(
                "process {}: dropping {} unmapped tables",
                self.options.pid,
                self.tables.len()
            );
        }
        self.ranges = ranges;
        self.tables = tables;
    }

    fn elf_options(&self) -> ElfTableOptions {
        ElfTableOptions {
            root_fs: self.options.root_fs.clone(),
            symbols: self.options.symbols.clone(),
        }
    }

    pub fn resolve(&mut self, addr: u64, cache: &mut ElfCache) -> Symbol {
        if is_stack_sentinel(addr) {
            return Symbol::end_of_stack();
        }
        let i = self.ranges.partition_point(|(r, _)| r.start <= addr);
        if i == 0 {
            return Symbol::default();
        }
        let (range, key) = &self.ranges[i - 1];
        if !range.contains(addr) {
            return Symbol::default();
        }
        match self.tables.get_mut(key) {
            Some(table) => {
                let name = table.resolve(addr, cache).unwrap_or_default();
                Symbol {
                    start: addr.wrapping_sub(table.base()),
                    name,
                    module: range.pathname.clone(),
                }
            }
            None => Symbol {
                start: addr,
                name: String::new(),
                module: range.pathname.clone(),
            },
        }
    }

    pub fn cleanup(&mut self) {
        for table in self.tables.values_mut() {
            table.cleanup();
        }
    }

    pub fn debug_info(&self) -> ProcTableDebugInfo {
        ProcTableDebugInfo {
            pid: self.options.pid,
            ranges: self.ranges.len(),
            error: self.error.as_ref().map(|e| e.to_string()),
            tables: self.tables.values().map(|t| t.debug_info()).collect(),
        }
    }
}

impl Resource for ProcTable {
    fn refresh(&mut self) {
        ProcTable::refresh(self);
    }

    fn cleanup(&mut self) {
        ProcTable::cleanup(self);
    }
}

fn maps_error(pid: u32, e: ProcError) -> SymtabError {
    let kind = match &e {
        ProcError::NotFound(_) => io::ErrorKind::NotFound,
        ProcError::PermissionDenied(_) => io::ErrorKind::PermissionDenied,
        ProcError::Io(err, _) => err.kind(),
        _ => io::ErrorKind::Other,
    };
    SymtabError::io(
        format!("/proc/{}/maps", pid),
        io::Error::new(kind, e.to_string()),
    )
}
