//! Symbolization of sampled instruction addresses.
//!
//! [`SymbolCache`] maps `(pid, address)` to a [`Symbol`] by walking the
//! process maps, the mapped ELF binaries and, for Go binaries, the runtime's
//! own function table.

pub mod address_index;
pub mod elf;
pub mod elf_cache;
pub mod elf_table;
pub mod elfgopclntab;
pub mod error;
pub mod gcache;
pub mod proc_table;
pub mod symbol_cache;
pub mod symbol_resolver;

#[cfg(test)]
mod testutil;

pub use elf::build_id::BuildId;
pub use elf::symbols::SymbolOptions;
pub use elf_cache::{ElfCache, FileIdentity};
pub use elf_table::{ElfTable, ElfTableOptions};
pub use error::{Result, SymtabError};
pub use gcache::{GCacheOptions, GenerationalCache, Resource};
pub use proc_table::{MemoryRange, ProcTable, ProcTableOptions};
pub use symbol_cache::{CacheOptions, SymbolCache};
pub use symbol_resolver::{SharedResolver, SymbolResolver};
pub use symtab_common::{PidKey, SampledAddress, Symbol};
