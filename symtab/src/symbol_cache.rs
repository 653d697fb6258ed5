//! Entry point: resolves `(pid, address)` pairs across many processes.

use log::debug;
use procfs::process::Process;
use procfs_core::ProcError;
use serde::Serialize;
use symtab_common::{PidKey, SampledAddress, Symbol};

use crate::elf::symbols::SymbolOptions;
use crate::elf_cache::{ElfCache, ElfCacheDebugInfo};
use crate::gcache::{EntryDebugInfo, GCacheOptions, GenerationalCache};
use crate::proc_table::{ProcTable, ProcTableDebugInfo, ProcTableOptions};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheOptions {
    pub pid_cache: GCacheOptions,
    pub build_id_cache: GCacheOptions,
    pub same_file_cache: GCacheOptions,
}

/// Per-process tables in front of the binaries shared between them.
///
/// Call [`SymbolCache::next_round`] once per collection cycle and
/// [`SymbolCache::cleanup`] after it to let idle entries age out.
pub struct SymbolCache {
    pid_cache: GenerationalCache<PidKey, ProcTable>,
    elf_cache: ElfCache,
    symbols: SymbolOptions,
}

impl SymbolCache {
    pub fn new(options: CacheOptions) -> Self {
        Self::with_symbol_options(options, SymbolOptions::default())
    }

    pub fn with_symbol_options(options: CacheOptions, symbols: SymbolOptions) -> Self {
        SymbolCache {
            pid_cache: GenerationalCache::new(options.pid_cache),
            elf_cache: ElfCache::new(options.build_id_cache, options.same_file_cache),
            symbols,
        }
    }

    pub fn resolve(&mut self, pid: u32, addr: u64) -> Symbol {
        let key = PidKey(pid);
        if !self.pid_cache.contains(&key) {
            let table = ProcTable::new(ProcTableOptions::new(pid, self.symbols.clone()));
            self.pid_cache.cache(key, table);
        }
        match self.pid_cache.get(&key) {
            Some(table) => table.resolve(addr, &mut self.elf_cache),
            None => Symbol::default(),
        }
    }

    pub fn resolve_samples(&mut self, samples: &[SampledAddress]) -> Vec<Symbol> {
        samples
            .iter()
            .map(|s| self.resolve(s.pid.0, s.addr))
            .collect()
    }

    pub fn next_round(&mut self) {
        self.pid_cache.next_round();
        self.elf_cache.next_round();
    }

    pub fn cleanup(&mut self) {
        self.elf_cache.cleanup();
        self.pid_cache.cleanup();
    }

    pub fn remove_dead_pid(&mut self, pid: u32) {
        self.pid_cache.remove(&PidKey(pid));
    }

    /// Drops cached processes whose `/proc/<pid>` is gone. Returns how many.
    pub fn sweep_dead_pids(&mut self) -> usize {
        let mut removed = 0;
        for key in self.pid_cache.keys() {
            if let Err(ProcError::NotFound(_)) = Process::new(key.0 as i32) {
                debug!("process {} exited", key);
                self.pid_cache.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    pub fn update_options(&mut self, options: CacheOptions) {
        self.pid_cache.update(options.pid_cache);
        self.elf_cache
            .update(options.build_id_cache, options.same_file_cache);
    }

    pub fn pid_cache_size(&self) -> usize {
        self.pid_cache.len()
    }

    pub fn pid_cache_debug_info(&self) -> Vec<EntryDebugInfo<ProcTableDebugInfo>> {
        self.pid_cache.debug_info(|_, table| table.debug_info())
    }

    pub fn elf_cache_debug_info(&self) -> ElfCacheDebugInfo {
        self.elf_cache.debug_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // pids above the kernel's pid_max
    const GONE: u32 = 0x7fff_fff0;

    #[inline(never)]
    fn resolve_me() -> u64 {
        resolve_me as usize as u64
    }

    fn options(size: usize, keep_rounds: u64) -> CacheOptions {
        let o = GCacheOptions { size, keep_rounds };
        CacheOptions {
            pid_cache: o,
            build_id_cache: o,
            same_file_cache: o,
        }
    }

    #[test]
    fn test_resolve_own_function() {
        let mut cache = SymbolCache::new(CacheOptions::default());
        let sym = cache.resolve(std::process::id(), resolve_me());
        assert!(!sym.module.is_empty(), "{:?}", sym);
        assert!(sym.name.contains("resolve_me"), "{:?}", sym);

        // second lookup is served from the same tables
        assert_eq!(cache.resolve(std::process::id(), resolve_me()), sym);
        assert_eq!(cache.pid_cache_size(), 1);
    }

    #[test]
    fn test_zero_pid_is_not_cached() {
        let mut cache = SymbolCache::new(CacheOptions::default());
        assert_eq!(cache.resolve(0, 0x401000), Symbol::default());
        assert_eq!(cache.pid_cache_size(), 0);
    }

    #[test]
    fn test_sentinels() {
        let mut cache = SymbolCache::new(CacheOptions::default());
        let sym = cache.resolve(std::process::id(), 0xcccccccccccccccc);
        assert_eq!(sym, Symbol::end_of_stack());
    }

    #[test]
    fn test_dead_pid() {
        let mut cache = SymbolCache::new(CacheOptions::default());
        assert_eq!(cache.resolve(GONE, 0x401000), Symbol::default());
        assert_eq!(cache.pid_cache_size(), 1);
        let info = cache.pid_cache_debug_info();
        assert!(info[0].info.error.is_some());

        cache.resolve(std::process::id(), resolve_me());
        assert_eq!(cache.sweep_dead_pids(), 1);
        assert_eq!(cache.pid_cache_size(), 1);

        cache.remove_dead_pid(std::process::id());
        assert_eq!(cache.pid_cache_size(), 0);
    }

    #[test]
    fn test_idle_pids_age_out() {
        let mut cache = SymbolCache::new(options(1, 1));
        cache.resolve(GONE, 0x1000);
        cache.resolve(GONE + 1, 0x1000);
        assert_eq!(cache.pid_cache_size(), 2);

        cache.next_round();
        cache.next_round();
        cache.resolve(GONE + 1, 0x1000);
        cache.cleanup();
        assert_eq!(cache.pid_cache_size(), 1);
        assert_eq!(cache.pid_cache_debug_info()[0].info.pid, GONE + 1);
    }

    #[test]
    fn test_update_options() {
        let mut cache = SymbolCache::new(options(4, 0));
        for pid in 0..3 {
            cache.resolve(GONE + pid, 0x1000);
        }
        cache.update_options(options(1, 0));
        cache.next_round();
        cache.cleanup();
        assert_eq!(cache.pid_cache_size(), 1);
    }

    #[test]
    fn test_debug_dumps_serialize() {
        let mut cache = SymbolCache::new(CacheOptions::default());
        cache.resolve(std::process::id(), resolve_me());
        let pids = serde_json::to_value(cache.pid_cache_debug_info()).unwrap();
        assert_eq!(pids[0]["info"]["pid"], std::process::id());
        let elfs = serde_json::to_value(cache.elf_cache_debug_info()).unwrap();
        assert!(elfs["build_id"].is_array());
    }

    #[test]
    fn test_resolve_samples() {
        let mut cache = SymbolCache::new(CacheOptions::default());
        let pid = PidKey(std::process::id());
        let symbols = cache.resolve_samples(&[
            SampledAddress { pid, addr: 0x9090909090909090 },
            SampledAddress { pid: PidKey(0), addr: 0x1000 },
        ]);
        assert_eq!(symbols, vec![Symbol::end_of_stack(), Symbol::default()]);
    }
}
