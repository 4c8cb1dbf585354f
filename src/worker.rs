//! Worker threads: each owns one VM and iterates a disjoint slice of the
//! 32-bit nonce space against the currently published job.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::job::Job;
use crate::randomx_ctx::VmHandle;
use crate::share::{Share, ShareSubmitter};

/// Disjoint nonce range assigned to one worker. `nonce_start` is inclusive;
/// the returned `nonce_end` is the exclusive upper bound as a `u64` so that
/// the whole-space case (`2**32`) is representable without colliding with
/// the in-range value `u32::MAX`. The last worker's range absorbs the
/// remainder so the union of all ranges covers `[0, 2**32)` exactly.
pub fn nonce_range(worker_id: usize, num_workers: usize) -> (u32, u64) {
    let span = (1u64 << 32) / num_workers as u64;
    let start = worker_id as u64 * span;
    let end = if worker_id + 1 == num_workers {
        1u64 << 32
    } else {
        (worker_id as u64 + 1) * span
    };
    (start as u32, end)
}

pub struct WorkerStats {
    pub hashes_done: AtomicU64,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            hashes_done: AtomicU64::new(0),
        }
    }
}

/// Runs one worker's loop until `stop` is set. `current_job` is an
/// atomically-swappable shared view of the supervisor's latest published
/// job; `None` means no job (or RandomX context mid-rebuild) is available
/// yet.
pub fn run(
    worker_id: usize,
    num_workers: usize,
    vm: Arc<Mutex<VmHandle>>,
    current_job: Arc<RwLock<Option<Arc<Job>>>>,
    submitter: ShareSubmitter,
    stop: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
    total_hashes: Arc<AtomicU64>,
) {
    let (nonce_start, nonce_end_exclusive) = nonce_range(worker_id, num_workers);

    let mut active_job_id: Option<String> = None;
    // Kept as u64, not u32: the last worker's range runs up to 2**32
    // (exclusive), one past the largest representable u32, so the loop
    // bound must not wrap when the range is exhausted.
    let mut nonce: u64 = nonce_start as u64;
    let mut last_rate_tick = Instant::now();
    let mut hashes_since_tick = 0u64;

    log::debug!("worker {worker_id} ready, nonce range starts at {nonce_start:#010x}");

    while !stop.load(Ordering::Relaxed) {
        let job = {
            let guard = current_job.read().unwrap();
            guard.clone()
        };
        let Some(job) = job else {
            std::thread::sleep(Duration::from_millis(50));
            continue;
        };

        if active_job_id.as_deref() != Some(job.job_id.as_str()) {
            active_job_id = Some(job.job_id.clone());
            nonce = nonce_start as u64;
        }

        if nonce >= nonce_end_exclusive {
            // This worker's slice of the current job is exhausted; wait for
            // the next job rather than wrapping into a neighbour's range.
            std::thread::sleep(Duration::from_millis(50));
            continue;
        }

        let nonce32 = nonce as u32;
        let blob = job.blob_with_nonce(nonce32);
        let hash = {
            let mut vm_guard = vm.lock().unwrap();
            match vm_guard.hash(&blob) {
                Ok(h) => h,
                Err(e) => {
                    log::warn!("worker {worker_id}: vm error: {e}");
                    drop(vm_guard);
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
            }
        };

        stats.hashes_done.fetch_add(1, Ordering::Relaxed);
        total_hashes.fetch_add(1, Ordering::Relaxed);
        hashes_since_tick += 1;

        if hash == [0u8; 32] {
            // A genuine RandomX hash is all-zero with negligible probability;
            // this is the VM-malfunction case, not an ordinary non-match.
            log::warn!("worker {worker_id}: vm produced an all-zero hash, skipping submission");
        } else if job.target.is_valid_hash(&hash) {
            let share = Share {
                job_id: job.job_id.clone(),
                nonce_hex: hex::encode(nonce32.to_le_bytes()),
                hash_hex: hex::encode(hash),
            };
            submitter.submit(share);
        }

        nonce += 1;
        if nonce % 256 == 0 {
            std::thread::yield_now();
        }

        if last_rate_tick.elapsed() >= Duration::from_secs(5) {
            let rate = hashes_since_tick as f64 / last_rate_tick.elapsed().as_secs_f64();
            log::debug!("worker {worker_id}: {rate:.0} H/s");
            hashes_since_tick = 0;
            last_rate_tick = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_worker_ranges_are_disjoint_and_cover_space() {
        let ranges: Vec<(u32, u64)> = (0..4).map(|i| nonce_range(i, 4)).collect();
        assert_eq!(ranges[0], (0x0000_0000, 0x4000_0000));
        assert_eq!(ranges[1], (0x4000_0000, 0x8000_0000));
        assert_eq!(ranges[2], (0x8000_0000, 0xc000_0000));
        assert_eq!(ranges[3].0, 0xc000_0000);
        assert_eq!(ranges[3].1, 1u64 << 32);
    }

    #[test]
    fn single_worker_covers_whole_space() {
        let (start, end) = nonce_range(0, 1);
        assert_eq!(start, 0);
        assert_eq!(end, 1u64 << 32);
    }
}
