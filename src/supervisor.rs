//! Supervisor: wires the pool session, RandomX context, workers and share
//! submitter together and drives the seed-change state machine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::args::Args;
use crate::error::Result;
use crate::job::Job;
use crate::pool::{LoginParams, PoolSession};
use crate::randomx_ctx::RandomXContext;
use crate::share::{ShareCounters, ShareSubmitter};
use crate::worker::{self, WorkerStats};

const HASHRATE_REPORT_INTERVAL: Duration = Duration::from_secs(10);

pub struct Supervisor {
    args: Args,
}

impl Supervisor {
    pub fn new(args: Args) -> Self {
        Self { args }
    }

    pub fn run(self) -> Result<()> {
        let args = &self.args;
        let num_workers = args.resolved_threads();
        log::info!("starting with {num_workers} worker thread(s), pool={}", args.pool);

        let stop = Arc::new(AtomicBool::new(false));
        install_signal_handler(Arc::clone(&stop));

        let login = LoginParams {
            login: args.wallet.clone(),
            pass: args.password.clone(),
            agent: args.user_agent.clone(),
            worker: args.worker.clone(),
        };
        let (session, first_job, job_rx) = PoolSession::connect(&args.pool, &login, Arc::clone(&stop))?;
        log::info!("logged in, session_id={}", session.session_id.read().unwrap());

        let counters = Arc::new(ShareCounters::default());
        let current_job: Arc<RwLock<Option<Arc<Job>>>> = Arc::new(RwLock::new(None));
        let submitter = ShareSubmitter::new(
            Arc::clone(&session),
            Arc::clone(&counters),
            Arc::clone(&current_job),
            Arc::clone(&stop),
        );

        let dataset_path = args.dataset_path.clone();
        let ctx = build_context(&first_job, num_workers, args.light_mode, args.large_pages, dataset_path.as_deref())?;
        let ctx = Arc::new(ctx);

        let total_hashes = Arc::new(AtomicU64::new(0));
        let mut worker_vms = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);
        let stats: Vec<Arc<WorkerStats>> = (0..num_workers).map(|_| Arc::new(WorkerStats::default())).collect();

        for worker_id in 0..num_workers {
            let vm = ctx.create_vm(worker_id)?;
            let vm = Arc::new(Mutex::new(vm));
            worker_vms.push(Arc::clone(&vm));

            let current_job = Arc::clone(&current_job);
            let submitter = submitter.clone();
            let stop = Arc::clone(&stop);
            let stats = Arc::clone(&stats[worker_id]);
            let total_hashes = Arc::clone(&total_hashes);
            handles.push(std::thread::spawn(move || {
                worker::run(worker_id, num_workers, vm, current_job, submitter, stop, stats, total_hashes)
            }));
        }

        *current_job.write().unwrap() = Some(Arc::new(first_job));

        let mut ctx_holder = ctx;
        let mut last_keepalive = Instant::now();
        let mut last_hash_report = Instant::now();
        let mut last_reported_total = 0u64;

        while !stop.load(Ordering::Relaxed) {
            match job_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(job) => {
                    if job.seed_hash != ctx_holder.seed_hash {
                        log::info!("seed change detected, rebuilding randomx context");
                        // Draining: park workers by clearing the published job.
                        *current_job.write().unwrap() = None;
                        std::thread::sleep(Duration::from_millis(150));

                        match build_context(
                            &job,
                            num_workers,
                            args.light_mode,
                            args.large_pages,
                            dataset_path.as_deref(),
                        ) {
                            Ok(new_ctx) => {
                                let new_ctx = Arc::new(new_ctx);
                                for (worker_id, vm_slot) in worker_vms.iter().enumerate() {
                                    match new_ctx.create_vm(worker_id) {
                                        Ok(new_vm) => {
                                            *vm_slot.lock().unwrap() = new_vm;
                                        }
                                        Err(e) => {
                                            log::error!("failed to rebuild VM for worker {worker_id}: {e}");
                                            stop.store(true, Ordering::Relaxed);
                                        }
                                    }
                                }
                                ctx_holder = new_ctx;
                            }
                            Err(e) => {
                                log::error!("seed rebuild failed: {e}");
                                stop.store(true, Ordering::Relaxed);
                            }
                        }
                    }
                    *current_job.write().unwrap() = Some(Arc::new(job));
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    // The pool session's background thread only exits once
                    // `stop` is set (it owns reconnection internally); this
                    // branch just lets the loop condition catch up.
                    log::debug!("pool session reader thread exited");
                    break;
                }
            }

            if last_keepalive.elapsed() >= PoolSession::keepalive_interval() {
                if let Err(e) = session.keepalive() {
                    log::warn!("keepalive failed: {e}");
                }
                last_keepalive = Instant::now();
            }

            if last_hash_report.elapsed() >= HASHRATE_REPORT_INTERVAL {
                let total_now = total_hashes.load(Ordering::Relaxed);
                let elapsed = last_hash_report.elapsed().as_secs_f64();
                let rate = (total_now.saturating_sub(last_reported_total)) as f64 / elapsed;
                log::info!(
                    "hashrate: {rate:.0} H/s, total_hashes={total_now}, accepted={}, rejected={}",
                    counters.accepted.load(Ordering::Relaxed),
                    counters.rejected.load(Ordering::Relaxed)
                );
                if log::log_enabled!(log::Level::Debug) {
                    for (worker_id, worker_stats) in stats.iter().enumerate() {
                        log::debug!(
                            "  worker {worker_id}: {} hashes total",
                            worker_stats.hashes_done.load(Ordering::Relaxed)
                        );
                    }
                }
                last_reported_total = total_now;
                last_hash_report = Instant::now();
            }
        }

        stop.store(true, Ordering::Relaxed);
        for h in handles {
            let _ = h.join();
        }
        log::info!(
            "shutdown complete: total_hashes={} accepted={} rejected={}",
            total_hashes.load(Ordering::Relaxed),
            counters.accepted.load(Ordering::Relaxed),
            counters.rejected.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

fn build_context(
    job: &Job,
    num_workers: usize,
    light_mode: bool,
    large_pages: bool,
    dataset_path: Option<&std::path::Path>,
) -> Result<RandomXContext> {
    RandomXContext::build(job.seed_hash, num_workers, !light_mode, large_pages, dataset_path)
}

static STOP_FLAG_PTR: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

extern "C" fn handle_sigint(_sig: libc::c_int) {
    let ptr = STOP_FLAG_PTR.load(Ordering::SeqCst) as *const AtomicBool;
    if !ptr.is_null() {
        unsafe { (*ptr).store(true, Ordering::SeqCst) };
    }
}

fn install_signal_handler(stop: Arc<AtomicBool>) {
    let raw = Arc::into_raw(stop) as usize;
    STOP_FLAG_PTR.store(raw, Ordering::SeqCst);
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
    }
}

#[cfg(test)]
mod tests {
    /// The same seed-epoch comparison the main loop performs before deciding
    /// whether to rebuild the RandomX context and reissue every worker's VM.
    fn seed_changed(current_seed: [u8; 32], job_seed: [u8; 32]) -> bool {
        job_seed != current_seed
    }

    #[test]
    fn identical_seed_does_not_trigger_rebuild() {
        let seed = [0x11u8; 32];
        assert!(!seed_changed(seed, seed));
    }

    #[test]
    fn differing_seed_triggers_rebuild() {
        let a = [0x11u8; 32];
        let b = [0x22u8; 32];
        assert!(seed_changed(a, b));
    }
}
