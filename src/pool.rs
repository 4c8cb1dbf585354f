//! Pool session: TCP framing, login, job dispatch, keep-alive and
//! reconnection for the newline-delimited JSON-RPC pool wire protocol.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{json, Value};

use crate::error::{MinerError, Result};
use crate::job::Job;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(1);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 3;

#[derive(Clone)]
pub struct LoginParams {
    pub login: String,
    pub pass: String,
    pub agent: String,
    pub worker: String,
}

/// A pending request's response, routed back from the reader thread by id.
type PendingMap = HashMap<u64, mpsc::Sender<Value>>;

/// Owns the TCP connection. The write half is shared (behind a mutex) by
/// every share submission and by the login/keep-alive calls; a single
/// background thread owns the read half for the whole process lifetime and
/// transparently reconnects (tearing down and re-logging in) when the
/// socket closes or a run of read errors suggests the link is dead.
pub struct PoolSession {
    write_stream: Mutex<TcpStream>,
    pending: Mutex<PendingMap>,
    rpc_id: AtomicU64,
    pub session_id: RwLock<String>,
    addr: String,
    login_params: LoginParams,
    stop: Arc<AtomicBool>,
}

impl PoolSession {
    /// Connect and log in, returning the session plus the first job from the
    /// login response. `stop` is checked by the background reconnect loop so
    /// shutdown doesn't wait out a pending backoff.
    pub fn connect(
        addr: &str,
        login: &LoginParams,
        stop: Arc<AtomicBool>,
    ) -> Result<(Arc<Self>, Job, mpsc::Receiver<Job>)> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| MinerError::TransportFatal(format!("connect {addr}: {e}")))?;
        stream.set_nodelay(true).ok();
        let read_stream = stream
            .try_clone()
            .map_err(|e| MinerError::TransportFatal(format!("clone socket: {e}")))?;

        let session = Arc::new(Self {
            write_stream: Mutex::new(stream),
            pending: Mutex::new(HashMap::new()),
            rpc_id: AtomicU64::new(1),
            session_id: RwLock::new(String::new()),
            addr: addr.to_string(),
            login_params: login.clone(),
            stop,
        });

        // Login is read directly off the same BufReader the connection-lifecycle
        // thread goes on to own: a one-off reader created just for the login
        // line can buffer-ahead past the first `\n` and silently swallow bytes
        // the main loop would otherwise see (e.g. a job push hot on the login
        // response's heels). No other message can legitimately arrive before a
        // successful login, so reading it synchronously here is safe.
        let mut reader = BufReader::new(read_stream);
        let first_job = session.login_over(&mut reader)?;

        let (job_tx, job_rx) = mpsc::channel();
        let lifecycle_session = Arc::clone(&session);
        std::thread::spawn(move || lifecycle_session.lifecycle_loop(reader, job_tx));

        Ok((session, first_job, job_rx))
    }

    fn next_id(&self) -> u64 {
        self.rpc_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Write the login request and read its response directly off `reader`.
    /// Only valid when nothing else is concurrently reading the socket
    /// (true during initial connect and during reconnect, both of which run
    /// before any other thread has a reason to read).
    fn login_over(&self, reader: &mut BufReader<TcpStream>) -> Result<Job> {
        let id = self.next_id();
        let request = json!({
            "id": id,
            "jsonrpc": "2.0",
            "method": "login",
            "params": {
                "login": self.login_params.login,
                "pass": self.login_params.pass,
                "agent": self.login_params.agent,
                "worker": self.login_params.worker,
            }
        });
        self.write_line(&request)?;

        reader
            .get_ref()
            .set_read_timeout(Some(LOGIN_TIMEOUT))
            .map_err(|e| MinerError::TransportFatal(format!("set read timeout: {e}")))?;
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|e| MinerError::TransportFatal(format!("login: {e}")))?;
        reader
            .get_ref()
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| MinerError::TransportFatal(format!("set read timeout: {e}")))?;

        if line.trim().is_empty() {
            return Err(MinerError::TransportFatal("connection closed during login".into()));
        }
        let value: Value = serde_json::from_str(line.trim_end())
            .map_err(|e| MinerError::ProtocolMalformed(format!("bad login response: {e}")))?;

        let result = value
            .get("result")
            .ok_or_else(|| MinerError::ProtocolMalformed("login response missing result".into()))?;
        let session_id = result
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| MinerError::ProtocolMalformed("login result missing id".into()))?;
        *self.session_id.write().unwrap() = session_id.to_string();

        let job_value = result
            .get("job")
            .ok_or_else(|| MinerError::ProtocolMalformed("login result missing job".into()))?;
        parse_job(job_value)
    }

    fn write_line(&self, value: &Value) -> Result<()> {
        let mut stream = self.write_stream.lock().unwrap();
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .map_err(|e| MinerError::TransportTransient(format!("write: {e}")))
    }

    /// Owns the connection for its whole lifetime: pumps incoming lines until
    /// the socket closes or a run of read errors looks fatal, then
    /// reconnects and re-logs in with a bounded backoff, over and over,
    /// until `stop` is set. Runs on its own background thread.
    fn lifecycle_loop(self: Arc<Self>, mut reader: BufReader<TcpStream>, job_tx: mpsc::Sender<Job>) {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return;
            }

            self.pump_until_disconnect(&mut reader, &job_tx);

            if self.stop.load(Ordering::Relaxed) {
                return;
            }
            log::warn!("pool {}: connection lost, reconnecting", self.addr);

            loop {
                if self.stop.load(Ordering::Relaxed) {
                    return;
                }
                std::thread::sleep(RECONNECT_BACKOFF);
                if self.stop.load(Ordering::Relaxed) {
                    return;
                }
                match self.reconnect() {
                    Ok((new_reader, job)) => {
                        log::info!("pool {}: reconnected and logged in", self.addr);
                        let _ = job_tx.send(job);
                        reader = new_reader;
                        break;
                    }
                    Err(e) => {
                        log::warn!("pool {}: reconnect attempt failed: {e}", self.addr);
                    }
                }
            }
        }
    }

    /// Tear down the current write stream and build a fresh connection,
    /// re-logging in over it. Any requests still pending against the old
    /// connection can never be answered, so the pending table is cleared;
    /// their callers are already bounded by their own recv timeouts.
    fn reconnect(&self) -> Result<(BufReader<TcpStream>, Job)> {
        let stream = TcpStream::connect(&self.addr)
            .map_err(|e| MinerError::TransportTransient(format!("reconnect {}: {e}", self.addr)))?;
        stream.set_nodelay(true).ok();
        let read_stream = stream
            .try_clone()
            .map_err(|e| MinerError::TransportTransient(format!("clone socket: {e}")))?;

        *self.write_stream.lock().unwrap() = stream;
        self.pending.lock().unwrap().clear();

        let mut reader = BufReader::new(read_stream);
        let job = self.login_over(&mut reader)?;
        Ok((reader, job))
    }

    /// Reads lines off `reader` until EOF or `MAX_CONSECUTIVE_READ_ERRORS`
    /// non-timeout errors in a row, dispatching job pushes on `job_tx` and
    /// responses to the matching pending sender. Returns (rather than
    /// retrying the connection itself) so the caller can own the reconnect
    /// backoff.
    fn pump_until_disconnect(&self, reader: &mut BufReader<TcpStream>, job_tx: &mpsc::Sender<Job>) {
        reader.get_ref().set_read_timeout(Some(READ_TIMEOUT)).ok();
        let mut consecutive_errors = 0u32;
        let mut line = String::new();
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return;
            }
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    log::warn!("pool {}: connection closed", self.addr);
                    return;
                }
                Ok(_) => {
                    consecutive_errors = 0;
                }
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    log::warn!(
                        "pool {}: read error ({consecutive_errors}/{MAX_CONSECUTIVE_READ_ERRORS}): {e}",
                        self.addr
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                        return;
                    }
                    continue;
                }
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("pool {}: malformed message ignored: {e}", self.addr);
                    continue;
                }
            };
            self.dispatch(value, job_tx);
        }
    }

    fn dispatch(&self, value: Value, job_tx: &mpsc::Sender<Job>) {
        if value.get("method").and_then(Value::as_str) == Some("job") {
            if let Some(params) = value.get("params") {
                match parse_job(params) {
                    Ok(job) => {
                        let _ = job_tx.send(job);
                    }
                    Err(e) => log::warn!("dropping malformed job push: {e}"),
                }
            }
            return;
        }

        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            let sender = self.pending.lock().unwrap().remove(&id);
            if let Some(sender) = sender {
                let _ = sender.send(value);
            }
        }
    }

    /// Send a keep-alive ping. Call periodically from the supervisor when
    /// the socket has otherwise been idle.
    pub fn keepalive(&self) -> Result<()> {
        let id = self.next_id();
        let request = json!({"id": id, "jsonrpc": "2.0", "method": "keepalived", "params": {}});
        self.write_line(&request)
    }

    pub fn keepalive_interval() -> Duration {
        KEEPALIVE_INTERVAL
    }

    /// Submit one share and wait (bounded) for the pool's response.
    pub fn submit_share(&self, job_id: &str, nonce_hex: &str, hash_hex: &str, algo: &str) -> Result<Value> {
        let id = self.next_id();
        let session_id = self.session_id.read().unwrap().clone();
        let request = json!({
            "id": id,
            "method": "submit",
            "params": [session_id, job_id, nonce_hex, hash_hex, algo],
        });

        let (tx, rx) = mpsc::channel();
        self.pending.lock().unwrap().insert(id, tx);
        if let Err(e) = self.write_line(&request) {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match rx.recv_timeout(SUBMIT_TIMEOUT) {
            Ok(v) => Ok(v),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(MinerError::TransportTransient("share response timed out".into()))
            }
        }
    }
}

fn parse_job(value: &Value) -> Result<Job> {
    let job_id = value
        .get("job_id")
        .and_then(Value::as_str)
        .ok_or_else(|| MinerError::ProtocolMalformed("job missing job_id".into()))?
        .to_string();
    let height = value.get("height").and_then(Value::as_u64).unwrap_or(0);
    let blob = value
        .get("blob")
        .and_then(Value::as_str)
        .ok_or_else(|| MinerError::ProtocolMalformed("job missing blob".into()))?;
    let seed_hash = value
        .get("seed_hash")
        .and_then(Value::as_str)
        .ok_or_else(|| MinerError::ProtocolMalformed("job missing seed_hash".into()))?;
    let target = value
        .get("target")
        .and_then(Value::as_str)
        .ok_or_else(|| MinerError::ProtocolMalformed("job missing target".into()))?;
    Job::new(job_id, height, seed_hash, blob, target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_frame_matches_canonical_shape() {
        let request = json!({
            "id": 7,
            "method": "submit",
            "params": ["abc", "42", "deadbeef", "00".repeat(32), "rx/0"],
        });
        let parsed: Value = serde_json::from_str(&request.to_string()).unwrap();
        assert_eq!(parsed["method"], "submit");
        assert_eq!(parsed["params"][0], "abc");
        assert_eq!(parsed["params"][1], "42");
        assert_eq!(parsed["params"][2], "deadbeef");
        assert_eq!(parsed["params"][4], "rx/0");
    }

    #[test]
    fn parse_job_reads_flat_params() {
        let blob = hex::encode([0u8; 76]);
        let value = json!({
            "job_id": "7",
            "height": 100,
            "blob": blob,
            "seed_hash": hex::encode([0u8; 32]),
            "target": "f3220000",
        });
        let job = parse_job(&value).unwrap();
        assert_eq!(job.job_id, "7");
        assert_eq!(job.height, 100);
    }

    #[test]
    fn parse_job_rejects_missing_fields() {
        let value = json!({"job_id": "7"});
        assert!(parse_job(&value).is_err());
    }
}
