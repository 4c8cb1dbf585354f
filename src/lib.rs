//! Salvium pool miner: RandomX worker pool, dataset management, and the
//! pool session wire protocol.

pub mod args;
pub mod error;
pub mod job;
pub mod pool;
pub mod randomx_ctx;
pub mod share;
pub mod supervisor;
pub mod target;
pub mod worker;
