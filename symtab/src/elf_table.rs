//! One mapped binary of one process.
//!
//! The table is loaded on the first lookup: it computes the load base from the
//! mapping, then takes a resolver from the [`ElfCache`] or builds one from a
//! separate debug file or from the binary itself.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, warn};
use object::elf::{PF_X, PT_LOAD};
use serde::Serialize;

use crate::elf::build_id::{read_build_id, BuildId};
use crate::elf::container::BinaryContainer;
use crate::elf::debug_file::{in_root, mini_debug_info, DebugFileLocator};
use crate::elf::symbols::{ElfSymbolTable, SymbolOptions, SymbolSections};
use crate::elf_cache::{ElfCache, FileIdentity};
use crate::elfgopclntab::GoRuntimeTable;
use crate::error::{Result, SymtabError};
use crate::gcache::Resource;
use crate::symbol_resolver::{ResolverDebugInfo, SharedResolver, SymbolResolver};

const PAGE_MASK: u64 = !0xfff;

#[derive(Clone, Debug)]
pub struct ElfTableOptions {
    /// Root filesystem of the process, usually `/proc/<pid>/root`.
    pub root_fs: PathBuf,
    pub symbols: SymbolOptions,
}

impl Default for ElfTableOptions {
    fn default() -> Self {
        ElfTableOptions {
            root_fs: PathBuf::from("/"),
            symbols: SymbolOptions::default(),
        }
    }
}

#[derive(Debug)]
enum State {
    NotLoaded,
    Loaded,
    LoadedFromCache,
    Failed(SymtabError),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::NotLoaded => "not_loaded",
            State::Loaded => "loaded",
            State::LoadedFromCache => "loaded_from_cache",
            State::Failed(_) => "failed",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ElfTableDebugInfo {
    pub path: String,
    pub base: String,
    pub state: &'static str,
    pub error: Option<String>,
    pub resolver: ResolverDebugInfo,
}

pub struct ElfTable {
    path: PathBuf,
    map_start: u64,
    map_offset: u64,
    options: ElfTableOptions,
    base: u64,
    state: State,
    resolver: SharedResolver,
}

impl ElfTable {
    /// `map_start` and `map_offset` describe the executable mapping of `path`.
    pub fn new(
        path: impl Into<PathBuf>,
        map_start: u64,
        map_offset: u64,
        options: ElfTableOptions,
    ) -> Self {
        ElfTable {
            path: path.into(),
            map_start,
            map_offset,
            options,
            base: 0,
            state: State::NotLoaded,
            resolver: SharedResolver::noop(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn error(&self) -> Option<&SymtabError> {
        match &self.state {
            State::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, State::Loaded | State::LoadedFromCache)
    }

    pub fn loaded_from_cache(&self) -> bool {
        matches!(self.state, State::LoadedFromCache)
    }

    pub fn resolver(&self) -> &SharedResolver {
        &self.resolver
    }

    /// Resolves an absolute address of this mapping.
    pub fn resolve(&mut self, pc: u64, cache: &mut ElfCache) -> Option<String> {
        if matches!(self.state, State::NotLoaded) {
            self.load(cache);
        }
        if !self.is_loaded() {
            return None;
        }
        if let Some(name) = self.resolver.resolve(pc.wrapping_sub(self.base)) {
            return Some(name);
        }
        if !self.resolver.is_dead() {
            return None;
        }

        if self.loaded_from_cache() {
            // someone else's incarnation died, ours may still be reachable
            debug!("cached resolver of {} is dead, reloading", self.path.display());
            self.resolver = SharedResolver::noop();
            self.state = State::NotLoaded;
            self.load(cache);
            if !self.is_loaded() {
                return None;
            }
            return self.resolver.resolve(pc.wrapping_sub(self.base));
        }

        debug!("{} is gone", self.path.display());
        self.resolver = SharedResolver::noop();
        self.state = State::Failed(SymtabError::FileDead(self.path.display().to_string()));
        None
    }

    fn load(&mut self, cache: &mut ElfCache) {
        match self.try_load(cache) {
            Ok(from_cache) => {
                self.state = if from_cache {
                    State::LoadedFromCache
                } else {
                    State::Loaded
                };
            }
            Err(e) => {
                if e.is_not_found() {
                    debug!("failed to load {}: {}", self.path.display(), e);
                } else {
                    warn!("failed to load {}: {}", self.path.display(), e);
                }
                self.state = State::Failed(e);
            }
        }
    }

    // Ok(true) when the resolver came from the cache
    fn try_load(&mut self, cache: &mut ElfCache) -> Result<bool> {
        let root_fs = self.options.root_fs.as_path();
        let fs_path = in_root(root_fs, &self.path);
        let mut binary = BinaryContainer::open(&fs_path)?;
        self.base = find_base(&mut binary, self.map_start, self.map_offset)?;

        let build_id = match read_build_id(&mut binary) {
            Ok(id) => id,
            Err(SymtabError::NoBuildIdSection) => BuildId::default(),
            Err(e) => return Err(e),
        };
        if let Some(resolver) = cache.get_by_build_id(&build_id) {
            self.resolver = resolver;
            return Ok(true);
        }
        let file = FileIdentity::of(&fs_path).map_err(|e| SymtabError::io(&fs_path, e))?;
        if let Some(resolver) = cache.get_by_stat(&file) {
            self.resolver = resolver;
            return Ok(true);
        }

        let locator = DebugFileLocator::new(root_fs);
        let resolver = match locator.find(&self.path, &build_id, &mut binary) {
            Some(debug_path) => {
                debug!(
                    "using {} for {}",
                    debug_path.display(),
                    self.path.display()
                );
                drop(binary);
                let debug_file = BinaryContainer::open(in_root(root_fs, &debug_path))?;
                create_symbol_table(debug_file, &self.options.symbols)?
            }
            None => create_symbol_table(binary, &self.options.symbols)?,
        };

        let mut resolver = SharedResolver::new(resolver);
        // lookups reopen the file on demand
        resolver.cleanup();
        if build_id.is_empty() {
            cache.cache_by_stat(file, resolver.clone());
        } else {
            cache.cache_by_build_id(build_id, resolver.clone());
        }
        self.resolver = resolver;
        Ok(false)
    }

    pub fn cleanup(&mut self) {
        self.resolver.cleanup();
    }

    pub fn debug_info(&self) -> ElfTableDebugInfo {
        ElfTableDebugInfo {
            path: self.path.display().to_string(),
            base: format!("0x{:x}", self.base),
            state: self.state.name(),
            error: self.error().map(|e| e.to_string()),
            resolver: self.resolver.debug_info(),
        }
    }
}

/// Load base of a mapping: the value to subtract from a runtime address to
/// get the address in the file.
pub fn find_base(c: &mut BinaryContainer, map_start: u64, map_offset: u64) -> Result<u64> {
    if c.is_exec() {
        return Ok(0);
    }
    c.program_headers()?
        .iter()
        .find(|p| p.p_type == PT_LOAD && p.flags & PF_X != 0 && p.offset & PAGE_MASK == map_offset)
        .map(|p| map_start.wrapping_sub(p.vaddr.wrapping_sub(p.offset - map_offset)))
        .ok_or(SymtabError::ElfBaseNotFound)
}

/// Builds the resolver for one ELF file.
///
/// A Go runtime table wins over ELF symbols inside the Go text range. When the
/// file has no `.symtab` but carries mini debug info, the embedded `.symtab`
/// is preferred over the file's `.dynsym`.
pub fn create_symbol_table(
    mut binary: BinaryContainer,
    options: &SymbolOptions,
) -> Result<SymbolResolver> {
    let mini = match mini_debug_info(&mut binary) {
        Ok(mini) => mini,
        Err(e) => {
            debug!("ignoring mini debug info of {}: {}", binary.name(), e);
            None
        }
    };
    let binary = Rc::new(RefCell::new(binary));

    let go = GoRuntimeTable::new(binary.clone());
    let skip = go.as_ref().ok().map(|t| t.range());
    let symbols = match mini {
        Some(mini) => {
            let mini = Rc::new(RefCell::new(mini));
            let embedded =
                ElfSymbolTable::new(mini, SymbolSections::SymtabOnly, skip.clone(), options);
            let dynamic = ElfSymbolTable::new(binary, SymbolSections::DynsymOnly, skip, options);
            match (embedded, dynamic) {
                (Ok(embedded), Ok(dynamic)) => Ok(SymbolResolver::fallback(
                    SymbolResolver::ElfSymbols(embedded),
                    SymbolResolver::ElfSymbols(dynamic),
                )),
                (Ok(embedded), Err(_)) => Ok(SymbolResolver::ElfSymbols(embedded)),
                (Err(_), Ok(dynamic)) => Ok(SymbolResolver::ElfSymbols(dynamic)),
                (Err(e), Err(_)) => Err(e),
            }
        }
        None => ElfSymbolTable::new(binary, SymbolSections::All, skip, options)
            .map(SymbolResolver::ElfSymbols),
    };

    match (go, symbols) {
        (Ok(go), Ok(symbols)) => Ok(SymbolResolver::fallback(
            SymbolResolver::GoRuntime(go),
            symbols,
        )),
        (Ok(go), Err(e)) => {
            debug!("using go symbols only: {}", e);
            Ok(SymbolResolver::GoRuntime(go))
        }
        (Err(_), Ok(symbols)) => Ok(symbols),
        (Err(go), Err(symbols)) => Err(SymtabError::NoUsableTable {
            symbols: Box::new(symbols),
            go: Box::new(go),
        }),
    }
}
