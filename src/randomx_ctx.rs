//! RandomX context manager.
//!
//! Owns the cache and (in full mode) the shared ~2GiB dataset for one seed
//! epoch, builds the dataset in parallel across helper threads, persists it
//! to disk, and hands out one VM per worker. The dataset-backed VM path is
//! not exposed by the safe `randomx-rs` wrapper (it only builds cache-bound
//! VMs), so this module talks to the native `randomx_*` symbols directly for
//! dataset allocation, parallel population, and dataset-backed VM creation.
//! Light mode (one 256MB cache per worker, no shared dataset) goes through
//! `randomx-rs` instead.

use std::ffi::c_void;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use randomx_rs::{RandomXCache, RandomXFlag, RandomXVM};

use crate::error::{MinerError, Result};

const FLAG_LARGE_PAGES: u32 = 0x1;
const FLAG_HARD_AES: u32 = 0x2;
const FLAG_FULL_MEM: u32 = 0x4;
const FLAG_JIT: u32 = 0x8;

extern "C" {
    fn randomx_alloc_dataset(flags: u32) -> *mut c_void;
    fn randomx_init_dataset(dataset: *mut c_void, cache: *mut c_void, start_item: u64, item_count: u64);
    fn randomx_dataset_item_count() -> u64;
    fn randomx_create_vm(flags: u32, cache: *mut c_void, dataset: *mut c_void) -> *mut c_void;
    fn randomx_destroy_vm(vm: *mut c_void);
    fn randomx_calculate_hash(vm: *mut c_void, input: *const u8, input_size: u64, output: *mut u8);
    fn randomx_alloc_cache(flags: u32) -> *mut c_void;
    fn randomx_init_cache(cache: *mut c_void, key: *const u8, key_size: u64);
    fn randomx_release_cache(cache: *mut c_void);
    fn randomx_release_dataset(dataset: *mut c_void);
    fn randomx_get_flags() -> u32;
}

/// Wrapper to send a raw native pointer across threads.
/// Safety: the dataset is read-only once initialised; cache is released
/// before any worker touches the dataset; VMs are never shared between
/// threads.
struct RawPtr(*mut c_void);
unsafe impl Send for RawPtr {}
unsafe impl Sync for RawPtr {}

const DATASET_ITEM_SIZE: u64 = 64;

/// One worker's handle onto the current RandomX epoch. Hashing goes through
/// whichever backing the context was built with.
pub enum VmHandle {
    Raw(*mut c_void),
    Wrapped(Box<RandomXVM>),
}

unsafe impl Send for VmHandle {}

impl VmHandle {
    pub fn hash(&mut self, input: &[u8]) -> Result<[u8; 32]> {
        match self {
            VmHandle::Raw(ptr) => {
                let mut out = [0u8; 32];
                unsafe {
                    randomx_calculate_hash(*ptr, input.as_ptr(), input.len() as u64, out.as_mut_ptr());
                }
                Ok(out)
            }
            VmHandle::Wrapped(vm) => {
                let v = vm
                    .calculate_hash(input)
                    .map_err(|e| MinerError::VmError(format!("{e:?}")))?;
                let mut out = [0u8; 32];
                out.copy_from_slice(&v);
                Ok(out)
            }
        }
    }
}

impl Drop for VmHandle {
    fn drop(&mut self) {
        if let VmHandle::Raw(ptr) = self {
            if !ptr.is_null() {
                unsafe { randomx_destroy_vm(*ptr) };
            }
        }
    }
}

enum Backing {
    /// Full mode: dataset shared by raw pointer across all VMs; `cache_ptr`
    /// is non-null only until released right after dataset init.
    Full { dataset_ptr: Arc<RawPtr> },
    /// Light mode: each VM owns its own cache, created lazily per worker.
    Light { flags: RandomXFlag, seed: Vec<u8> },
}

/// Owns exactly one seed epoch's worth of RandomX state.
pub struct RandomXContext {
    pub seed_hash: [u8; 32],
    backing: Backing,
}

impl RandomXContext {
    /// Build (or reload from disk) the context for `seed_hash`. `num_workers`
    /// is only used to size the dataset-build thread pool in full mode.
    pub fn build(
        seed_hash: [u8; 32],
        num_workers: usize,
        full_mode: bool,
        use_large_pages: bool,
        dataset_path: Option<&Path>,
    ) -> Result<Self> {
        if full_mode {
            Self::build_full(seed_hash, num_workers, use_large_pages, dataset_path)
        } else {
            Self::build_light(seed_hash, use_large_pages)
        }
    }

    fn build_full(
        seed_hash: [u8; 32],
        num_workers: usize,
        use_large_pages: bool,
        dataset_path: Option<&Path>,
    ) -> Result<Self> {
        let base_flags = unsafe { randomx_get_flags() } | FLAG_FULL_MEM | FLAG_JIT;
        let (flags, large_pages) = if use_large_pages {
            probe_large_pages(base_flags)
        } else {
            (base_flags, false)
        };
        log::info!(
            "randomx: large pages {}",
            if large_pages { "enabled" } else { "disabled" }
        );

        let dataset_ptr = unsafe { randomx_alloc_dataset(flags) };
        if dataset_ptr.is_null() {
            return Err(MinerError::SeedBuildFailed(
                "failed to allocate dataset (need ~2GiB free RAM)".into(),
            ));
        }
        let item_count = unsafe { randomx_dataset_item_count() };

        if let Some(path) = dataset_path {
            if try_load_dataset(path, &seed_hash, item_count, dataset_ptr) {
                log::info!("randomx: reused persisted dataset for current seed");
                return Ok(Self {
                    seed_hash,
                    backing: Backing::Full {
                        dataset_ptr: Arc::new(RawPtr(dataset_ptr)),
                    },
                });
            }
        }

        let cache_ptr = unsafe { randomx_alloc_cache(flags) };
        if cache_ptr.is_null() {
            unsafe { randomx_release_dataset(dataset_ptr) };
            return Err(MinerError::SeedBuildFailed("failed to allocate cache".into()));
        }
        unsafe { randomx_init_cache(cache_ptr, seed_hash.as_ptr(), seed_hash.len() as u64) };

        log::info!("randomx: building dataset ({item_count} items, ~2GiB)");
        let start = std::time::Instant::now();

        let num_threads = num_workers.max(1);
        let items_per_thread = item_count / num_threads as u64;
        let ds_shared = Arc::new(RawPtr(dataset_ptr));
        let ca_shared = Arc::new(RawPtr(cache_ptr));
        let mut handles = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let ds = Arc::clone(&ds_shared);
            let ca = Arc::clone(&ca_shared);
            let start_item = i as u64 * items_per_thread;
            let count = if i == num_threads - 1 {
                item_count - start_item
            } else {
                items_per_thread
            };
            handles.push(thread::spawn(move || unsafe {
                randomx_init_dataset(ds.0, ca.0, start_item, count);
            }));
        }
        for h in handles {
            let _ = h.join();
        }
        log::info!("randomx: dataset built in {:.1}s", start.elapsed().as_secs_f64());

        unsafe { randomx_release_cache(cache_ptr) };

        if let Some(path) = dataset_path {
            if let Err(e) = save_dataset(path, &seed_hash, item_count, dataset_ptr) {
                log::warn!("randomx: failed to persist dataset: {e}");
            }
        }

        Ok(Self {
            seed_hash,
            backing: Backing::Full {
                dataset_ptr: ds_shared,
            },
        })
    }

    fn build_light(seed_hash: [u8; 32], use_large_pages: bool) -> Result<Self> {
        let mut flags = RandomXFlag::get_recommended_flags();
        if use_large_pages {
            let raw = flags.bits() | FLAG_LARGE_PAGES;
            let test_cache = unsafe { randomx_alloc_cache(raw) };
            if !test_cache.is_null() {
                unsafe { randomx_release_cache(test_cache) };
                flags |= RandomXFlag::FLAG_LARGE_PAGES;
                log::info!("randomx: large pages enabled (light mode)");
            } else {
                log::info!("randomx: large pages unavailable, falling back");
            }
        }
        Ok(Self {
            seed_hash,
            backing: Backing::Light {
                flags,
                seed: seed_hash.to_vec(),
            },
        })
    }

    /// Create one VM for `worker_id`. In full mode every VM shares the same
    /// dataset pointer; in light mode each VM gets its own 256MB cache.
    pub fn create_vm(&self, worker_id: usize) -> Result<VmHandle> {
        match &self.backing {
            Backing::Full { dataset_ptr } => {
                let base_flags = unsafe { randomx_get_flags() } | FLAG_FULL_MEM | FLAG_JIT | FLAG_HARD_AES;
                let vm_ptr = unsafe { randomx_create_vm(base_flags, std::ptr::null_mut(), dataset_ptr.0) };
                if vm_ptr.is_null() {
                    return Err(MinerError::SeedBuildFailed(format!(
                        "worker {worker_id} failed to create VM"
                    )));
                }
                Ok(VmHandle::Raw(vm_ptr))
            }
            Backing::Light { flags, seed } => {
                let cache = RandomXCache::new(*flags, seed)
                    .map_err(|e| MinerError::SeedBuildFailed(format!("{e:?}")))?;
                let vm = RandomXVM::new(*flags, Some(cache), None)
                    .map_err(|e| MinerError::SeedBuildFailed(format!("{e:?}")))?;
                Ok(VmHandle::Wrapped(Box::new(vm)))
            }
        }
    }
}

impl Drop for RandomXContext {
    fn drop(&mut self) {
        if let Backing::Full { dataset_ptr } = &self.backing {
            if Arc::strong_count(dataset_ptr) == 1 && !dataset_ptr.0.is_null() {
                unsafe { randomx_release_dataset(dataset_ptr.0) };
            }
        }
    }
}

fn probe_large_pages(base_flags: u32) -> (u32, bool) {
    let with_lp = base_flags | FLAG_LARGE_PAGES;
    let test_cache = unsafe { randomx_alloc_cache(with_lp) };
    if !test_cache.is_null() {
        unsafe { randomx_release_cache(test_cache) };
        (with_lp, true)
    } else {
        (base_flags, false)
    }
}

fn sidecar_path(dataset_path: &Path) -> PathBuf {
    let mut p = dataset_path.as_os_str().to_owned();
    p.push(".seed");
    PathBuf::from(p)
}

/// Attempt to load a persisted dataset from disk into an already-allocated
/// dataset pointer. Returns true iff the sidecar seed matched and the file
/// was exactly the expected size.
fn try_load_dataset(path: &Path, seed_hash: &[u8; 32], item_count: u64, dataset_ptr: *mut c_void) -> bool {
    let sidecar = sidecar_path(path);
    let expected_seed_hex = hex::encode(seed_hash);
    let stored_seed = match fs::read_to_string(&sidecar) {
        Ok(s) => s,
        Err(_) => return false,
    };
    if stored_seed.lines().next().unwrap_or("") != expected_seed_hex {
        return false;
    }
    let expected_size = item_count * DATASET_ITEM_SIZE;
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let metadata = match file.metadata() {
        Ok(m) => m,
        Err(_) => return false,
    };
    if metadata.len() != expected_size {
        return false;
    }
    // SAFETY: dataset_ptr was just allocated by randomx_alloc_dataset with
    // capacity for item_count * DATASET_ITEM_SIZE bytes.
    let buf = unsafe { std::slice::from_raw_parts_mut(dataset_ptr as *mut u8, expected_size as usize) };
    if file.read_exact(buf).is_err() {
        return false;
    }
    true
}

fn save_dataset(path: &Path, seed_hash: &[u8; 32], item_count: u64, dataset_ptr: *mut c_void) -> Result<()> {
    let size = (item_count * DATASET_ITEM_SIZE) as usize;
    // SAFETY: dataset_ptr holds exactly `size` initialised bytes after a
    // successful parallel init pass.
    let buf = unsafe { std::slice::from_raw_parts(dataset_ptr as *const u8, size) };
    let tmp_path = {
        let mut p = path.as_os_str().to_owned();
        p.push(".tmp");
        PathBuf::from(p)
    };
    fs::write(&tmp_path, buf)?;
    fs::rename(&tmp_path, path)?;
    let mut sidecar = fs::File::create(sidecar_path(path))?;
    writeln!(sidecar, "{}", hex::encode(seed_hash))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_path_appends_suffix() {
        let p = sidecar_path(Path::new("/tmp/randomx_dataset.bin"));
        assert_eq!(p, PathBuf::from("/tmp/randomx_dataset.bin.seed"));
    }
}
