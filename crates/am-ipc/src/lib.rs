//! Worker pool / IPC protocol for the alert manager (spec §4.6, §6).
//!
//! The manager speaks a tiny two-message protocol to a fixed pool of worker
//! processes: `REGISTER` (worker announces itself, validated against the
//! manager's own parent pid) and `RESULT` (worker reports the outcome of the
//! one alert it was handed). `WorkerTransport` abstracts the channel so the
//! scheduler's main loop doesn't care whether workers are out-of-process
//! (the production deployment, out of scope here per spec §1) or in-process
//! tasks (`local`, the transport this crate actually ships).

pub mod error;
pub mod job;
pub mod local;
pub mod pool;

pub use error::IpcError;
pub use job::{build_job, shell_quote, DispatchJob, JobBuildError};
pub use pool::{ClientId, WorkerPool};

use am_common::DeliveryResult;
use async_trait::async_trait;
use std::time::Duration;

/// A message arriving from a worker, named after the two IPC commands spec
/// §4.6 defines.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Register { client_id: ClientId, pid: u32 },
    /// A worker reports the outcome of the alert its slot was handling.
    /// Identified by `client_id`, not `result.alertid` — per spec §4.6, the
    /// manager looks up the slot by client handle and treats an unknown
    /// handle as fatal (it means the slot bookkeeping and the transport
    /// have disagreed about which worker is busy).
    Result { client_id: ClientId, result: DeliveryResult },
}

/// The manager's view of the worker channel. Grounded on `fc-queue`'s
/// `QueueConsumer`/`QueuePublisher` split: receiving worker events and
/// handing out jobs are independent concerns even though this crate's only
/// implementation (`local::LocalTransport`) backs both with the same pair of
/// channels.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Wait up to `timeout` for the next worker event. `None` on timeout,
    /// matching the main loop's one-second IPC recv deadline (spec §4.7).
    async fn recv_event(&mut self, timeout: Duration) -> Option<WorkerEvent>;

    /// Hand `job` to the worker occupying `client_id`'s slot.
    async fn send_job(&self, client_id: ClientId, job: DispatchJob) -> Result<(), IpcError>;
}
