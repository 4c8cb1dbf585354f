//! Integration test against an in-process mock pool: exercises the wire
//! framing a real pool session goes through (login, job push, share
//! submit/response) over an actual TCP socket, and checks the seed
//! comparison the supervisor uses to decide whether a pushed job starts a
//! new RandomX epoch.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use salvium_miner::pool::{LoginParams, PoolSession};

fn sample_blob_hex() -> String {
    hex::encode([0u8; 76])
}

fn read_request(reader: &mut BufReader<std::net::TcpStream>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    serde_json::from_str(line.trim_end()).unwrap()
}

#[test]
fn pool_session_logs_in_pushes_job_and_submits_a_share() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = stream;

        let login_req = read_request(&mut reader);
        let id = login_req["id"].as_u64().unwrap();

        let blob = sample_blob_hex();
        let seed_a = hex::encode([0xaau8; 32]);
        let login_response = serde_json::json!({
            "id": id,
            "result": {
                "id": "session-123",
                "job": {
                    "job_id": "1",
                    "height": 100,
                    "blob": blob,
                    "seed_hash": seed_a,
                    "target": "f3220000",
                }
            }
        });
        writer
            .write_all(format!("{login_response}\n").as_bytes())
            .unwrap();

        // Push a second job on a new seed epoch: this is the wire-level
        // event that drives the supervisor's rebuild decision.
        let seed_b = hex::encode([0xbbu8; 32]);
        let job_push = serde_json::json!({
            "method": "job",
            "params": {
                "job_id": "2",
                "height": 101,
                "blob": blob,
                "seed_hash": seed_b,
                "target": "f3220000",
            }
        });
        writer.write_all(format!("{job_push}\n").as_bytes()).unwrap();

        let submit_req = read_request(&mut reader);
        let submit_id = submit_req["id"].as_u64().unwrap();
        assert_eq!(submit_req["params"][1], "1");
        let submit_response = serde_json::json!({"id": submit_id, "result": {"status": "OK"}});
        writer
            .write_all(format!("{submit_response}\n").as_bytes())
            .unwrap();

        thread::sleep(Duration::from_millis(200));
    });

    let login = LoginParams {
        login: "wallet-address".to_string(),
        pass: "x".to_string(),
        agent: "test-miner/1".to_string(),
        worker: "w1".to_string(),
    };
    let stop = Arc::new(AtomicBool::new(false));
    let (session, first_job, job_rx) =
        PoolSession::connect(&addr.to_string(), &login, Arc::clone(&stop)).unwrap();

    assert_eq!(first_job.job_id, "1");
    assert_eq!(*session.session_id.read().unwrap(), "session-123");
    let first_seed = first_job.seed_hash;

    let pushed_job = job_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(pushed_job.job_id, "2");

    // Mirrors the comparison supervisor::run performs before rebuilding the
    // RandomX context and reissuing every worker's VM.
    assert_ne!(pushed_job.seed_hash, first_seed);

    let response = session
        .submit_share(&first_job.job_id, "deadbeef", &"00".repeat(32), "rx/0")
        .unwrap();
    assert_eq!(response["result"]["status"], "OK");

    stop.store(true, Ordering::Relaxed);
    server.join().unwrap();
}
