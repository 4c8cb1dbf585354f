//! Share submitter: applies the retry policy on top of the pool session's
//! raw submit/response round trip.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;

use crate::error::MinerError;
use crate::job::Job;
use crate::pool::PoolSession;

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_ALGO: &str = "rx/0";

#[derive(Debug, Clone)]
pub struct Share {
    pub job_id: String,
    pub nonce_hex: String,
    pub hash_hex: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(String),
    Stale,
    JobNotFound,
    TransportError,
}

pub struct ShareCounters {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
}

impl Default for ShareCounters {
    fn default() -> Self {
        Self {
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }
}

#[derive(Clone)]
pub struct ShareSubmitter {
    session: Arc<PoolSession>,
    counters: Arc<ShareCounters>,
    current_job: Arc<RwLock<Option<Arc<Job>>>>,
    stop: Arc<AtomicBool>,
    algo: String,
}

impl ShareSubmitter {
    pub fn new(
        session: Arc<PoolSession>,
        counters: Arc<ShareCounters>,
        current_job: Arc<RwLock<Option<Arc<Job>>>>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            session,
            counters,
            current_job,
            stop,
            algo: DEFAULT_ALGO.to_string(),
        }
    }

    /// Fire-and-forget from a worker's perspective: runs the full retry
    /// policy synchronously on the calling (worker) thread, since shares are
    /// rare relative to hash attempts and blocking one worker briefly does
    /// not stall the others.
    ///
    /// Checks the share's job id against the currently published job first.
    /// A mismatch means the job was superseded between the worker finding
    /// the share and calling this method; the miner already knows the share
    /// is stale, so it is dropped locally without ever reaching the wire.
    pub fn submit(&self, share: Share) {
        if !self.is_current_job(&share.job_id) {
            log::debug!(
                "dropping share for superseded job={} (early reject, never sent)",
                share.job_id
            );
            return;
        }

        let outcome = self.submit_with_retry(&share);
        match outcome {
            SubmitOutcome::Accepted => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                log::info!("share accepted: job={} nonce={}", share.job_id, share.nonce_hex);
            }
            SubmitOutcome::Rejected(reason) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("share rejected: job={} reason={reason}", share.job_id);
            }
            SubmitOutcome::Stale => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("share rejected: job={} reason=stale", share.job_id);
            }
            SubmitOutcome::JobNotFound => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("share rejected: job={} reason=job-not-found", share.job_id);
            }
            SubmitOutcome::TransportError => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("share lost: job={} reason=transport-error (exhausted retries)", share.job_id);
            }
        }
    }

    fn is_current_job(&self, job_id: &str) -> bool {
        self.current_job
            .read()
            .unwrap()
            .as_ref()
            .map(|job| job.job_id == job_id)
            .unwrap_or(false)
    }

    fn submit_with_retry(&self, share: &Share) -> SubmitOutcome {
        let mut attempt = 0;
        loop {
            match self.submit_once(share) {
                Ok(outcome) => match outcome {
                    SubmitOutcome::Stale | SubmitOutcome::JobNotFound | SubmitOutcome::Accepted => {
                        return outcome
                    }
                    SubmitOutcome::Rejected(_) | SubmitOutcome::TransportError => {
                        attempt += 1;
                        if attempt > MAX_RETRIES || self.sleep_or_stop(RETRY_DELAY) {
                            return outcome;
                        }
                    }
                },
                Err(_) => {
                    attempt += 1;
                    if attempt > MAX_RETRIES || self.sleep_or_stop(RETRY_DELAY) {
                        return SubmitOutcome::TransportError;
                    }
                }
            }
        }
    }

    /// Sleeps for `duration` in short increments so shutdown isn't delayed
    /// behind an in-flight retry. Returns `true` if `stop` was observed
    /// (the caller should give up rather than retry again).
    fn sleep_or_stop(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.stop.load(Ordering::Relaxed) {
                return true;
            }
            let step = remaining.min(STOP_POLL_INTERVAL);
            std::thread::sleep(step);
            remaining -= step;
        }
        self.stop.load(Ordering::Relaxed)
    }

    fn submit_once(&self, share: &Share) -> Result<SubmitOutcome, MinerError> {
        let response = self
            .session
            .submit_share(&share.job_id, &share.nonce_hex, &share.hash_hex, &self.algo)?;
        Ok(classify_response(&response))
    }
}

/// Tolerates both the plain-boolean and the `{"status": "..."}" response
/// shapes a pool may send.
fn classify_response(value: &Value) -> SubmitOutcome {
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let lower = message.to_lowercase();
        if lower.contains("stale") {
            return SubmitOutcome::Stale;
        }
        if lower.contains("job not found") || lower.contains("unknown job") {
            return SubmitOutcome::JobNotFound;
        }
        return SubmitOutcome::Rejected(message);
    }

    if let Some(result) = value.get("result") {
        if let Some(b) = result.as_bool() {
            return if b {
                SubmitOutcome::Accepted
            } else {
                SubmitOutcome::Rejected("result:false".into())
            };
        }
        if let Some(status) = result.get("status").and_then(Value::as_str) {
            return if status.eq_ignore_ascii_case("ok") {
                SubmitOutcome::Accepted
            } else {
                SubmitOutcome::Rejected(status.to_string())
            };
        }
    }

    SubmitOutcome::Rejected("unrecognised response shape".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_status_ok_shape() {
        let v = json!({"result": {"status": "OK"}});
        assert_eq!(classify_response(&v), SubmitOutcome::Accepted);
    }

    #[test]
    fn accepts_bare_bool_shape() {
        let v = json!({"result": true});
        assert_eq!(classify_response(&v), SubmitOutcome::Accepted);
    }

    #[test]
    fn stale_error_is_classified_stale() {
        let v = json!({"error": {"code": -1, "message": "Share is stale"}});
        assert_eq!(classify_response(&v), SubmitOutcome::Stale);
    }

    #[test]
    fn unknown_job_error_is_job_not_found() {
        let v = json!({"error": {"code": -2, "message": "Job not found"}});
        assert_eq!(classify_response(&v), SubmitOutcome::JobNotFound);
    }

    #[test]
    fn other_rejection_carries_reason() {
        let v = json!({"error": {"code": -5, "message": "Low difficulty share"}});
        match classify_response(&v) {
            SubmitOutcome::Rejected(reason) => assert_eq!(reason, "Low difficulty share"),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }
}
