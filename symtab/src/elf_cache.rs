//! Resolvers shared between processes that map the same binary.

use std::hash::Hash;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use log::debug;
use serde::Serialize;

use crate::elf::build_id::BuildId;
use crate::gcache::{EntryDebugInfo, GCacheOptions, GenerationalCache};
use crate::symbol_resolver::{ResolverDebugInfo, SharedResolver};

/// `(device, inode)` of a file, the cache key for binaries without a build ID.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
}

impl FileIdentity {
    pub fn of(path: &Path) -> io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(FileIdentity {
            device: meta.dev(),
            inode: meta.ino(),
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ElfCacheEntry<K> {
    pub key: K,
    pub resolver: ResolverDebugInfo,
}

#[derive(Clone, Debug, Serialize)]
pub struct ElfCacheDebugInfo {
    pub build_id: Vec<EntryDebugInfo<ElfCacheEntry<BuildId>>>,
    pub same_file: Vec<EntryDebugInfo<ElfCacheEntry<FileIdentity>>>,
}

pub struct ElfCache {
    build_id: GenerationalCache<BuildId, SharedResolver>,
    same_file: GenerationalCache<FileIdentity, SharedResolver>,
}

impl ElfCache {
    pub fn new(build_id: GCacheOptions, same_file: GCacheOptions) -> Self {
        ElfCache {
            build_id: GenerationalCache::new(build_id),
            same_file: GenerationalCache::new(same_file),
        }
    }

    pub fn get_by_build_id(&mut self, id: &BuildId) -> Option<SharedResolver> {
        live(&mut self.build_id, id)
    }

    pub fn cache_by_build_id(&mut self, id: BuildId, resolver: SharedResolver) {
        self.build_id.cache(id, resolver);
    }

    pub fn get_by_stat(&mut self, file: &FileIdentity) -> Option<SharedResolver> {
        live(&mut self.same_file, file)
    }

    pub fn cache_by_stat(&mut self, file: FileIdentity, resolver: SharedResolver) {
        self.same_file.cache(file, resolver);
    }

    pub fn next_round(&mut self) {
        self.build_id.next_round();
        self.same_file.next_round();
    }

    pub fn cleanup(&mut self) {
        self.build_id.cleanup();
        self.same_file.cleanup();
    }

    pub fn update(&mut self, build_id: GCacheOptions, same_file: GCacheOptions) {
        self.build_id.update(build_id);
        self.same_file.update(same_file);
    }

    pub fn len(&self) -> usize {
        self.build_id.len() + self.same_file.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn debug_info(&self) -> ElfCacheDebugInfo {
        ElfCacheDebugInfo {
            build_id: self.build_id.debug_info(entry),
            same_file: self.same_file.debug_info(entry),
        }
    }
}

fn entry<K: Clone>(key: &K, resolver: &SharedResolver) -> ElfCacheEntry<K> {
    ElfCacheEntry {
        key: key.clone(),
        resolver: resolver.debug_info(),
    }
}

// a dead resolver is evicted on lookup so the next load starts over
fn live<K>(cache: &mut GenerationalCache<K, SharedResolver>, key: &K) -> Option<SharedResolver>
where
    K: Hash + Eq + Clone + Default,
{
    let resolver = cache.get(key)?.clone();
    if resolver.is_dead() {
        debug!("dropping dead resolver from elf cache");
        cache.remove(key);
        return None;
    }
    Some(resolver)
}
