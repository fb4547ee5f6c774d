//! In-process `WorkerTransport`: workers are tokio tasks communicating over
//! `tokio::sync::mpsc` channels rather than separate OS processes. Spec §1
//! places the real local-IPC worker service out of scope; this transport is
//! the stand-in that lets `bin/am-manager` and this crate's own tests drive
//! the full register/dispatch/result loop without an external process.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::IpcError;
use crate::job::DispatchJob;
use crate::{ClientId, WorkerEvent, WorkerTransport};

/// Manager-side half of the channel pair.
pub struct LocalTransport {
    events_rx: mpsc::Receiver<WorkerEvent>,
    job_txs: HashMap<ClientId, mpsc::Sender<DispatchJob>>,
}

/// Worker-side handle: one per slot, given to whatever task simulates a
/// worker process.
pub struct WorkerHandle {
    pub client_id: ClientId,
    events_tx: mpsc::Sender<WorkerEvent>,
    job_rx: mpsc::Receiver<DispatchJob>,
}

impl WorkerHandle {
    /// Announce this worker to the manager. Call once, at startup, before
    /// receiving any job.
    pub async fn send_register(&self, pid: u32) {
        let _ = self
            .events_tx
            .send(WorkerEvent::Register {
                client_id: self.client_id,
                pid,
            })
            .await;
    }

    /// Block until the manager hands this worker a job.
    pub async fn recv_job(&mut self) -> Option<DispatchJob> {
        self.job_rx.recv().await
    }

    /// Report the outcome of the job this worker was just handed.
    pub async fn send_result(&self, result: am_common::DeliveryResult) {
        let _ = self
            .events_tx
            .send(WorkerEvent::Result {
                client_id: self.client_id,
                result,
            })
            .await;
    }
}

impl LocalTransport {
    /// Build a transport with `capacity` worker channels, returning the
    /// manager-side transport and one `WorkerHandle` per slot.
    pub fn new(capacity: usize) -> (Self, Vec<WorkerHandle>) {
        let (events_tx, events_rx) = mpsc::channel(capacity.max(1) * 4);
        let mut job_txs = HashMap::with_capacity(capacity);
        let mut handles = Vec::with_capacity(capacity);

        for client_id in 0..capacity as ClientId {
            let (job_tx, job_rx) = mpsc::channel(4);
            job_txs.insert(client_id, job_tx);
            handles.push(WorkerHandle {
                client_id,
                events_tx: events_tx.clone(),
                job_rx,
            });
        }

        (Self { events_rx, job_txs }, handles)
    }
}

#[async_trait]
impl WorkerTransport for LocalTransport {
    async fn recv_event(&mut self, timeout: Duration) -> Option<WorkerEvent> {
        tokio::time::timeout(timeout, self.events_rx.recv())
            .await
            .ok()
            .flatten()
    }

    async fn send_job(&self, client_id: ClientId, job: DispatchJob) -> Result<(), IpcError> {
        let tx = self
            .job_txs
            .get(&client_id)
            .ok_or(IpcError::UnknownSlot(client_id))?;
        tx.send(job).await.map_err(|_| IpcError::TransportClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_common::DeliveryResult;

    #[tokio::test]
    async fn register_then_job_then_result_round_trips() {
        let (mut transport, mut handles) = LocalTransport::new(1);
        let mut worker = handles.remove(0);

        worker.send_register(1234).await;
        let event = transport.recv_event(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            event,
            WorkerEvent::Register { client_id: 0, pid: 1234 }
        ));

        transport
            .send_job(
                0,
                DispatchJob::Exec {
                    alertid: 7,
                    command_line: "'/bin/true'".into(),
                },
            )
            .await
            .unwrap();
        let job = worker.recv_job().await.unwrap();
        assert!(matches!(job, DispatchJob::Exec { alertid: 7, .. }));

        worker
            .send_result(DeliveryResult {
                alertid: 7,
                ok: true,
                errmsg: String::new(),
            })
            .await;
        let event = transport.recv_event(Duration::from_secs(1)).await.unwrap();
        match event {
            WorkerEvent::Result { client_id, result } => {
                assert_eq!(client_id, 0);
                assert_eq!(result.alertid, 7);
            }
            other => panic!("expected Result event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recv_event_times_out_when_idle() {
        let (mut transport, _handles) = LocalTransport::new(1);
        let event = transport.recv_event(Duration::from_millis(20)).await;
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn send_job_to_unknown_client_is_unknown_slot() {
        let (transport, _handles) = LocalTransport::new(1);
        let err = transport
            .send_job(
                99,
                DispatchJob::Exec {
                    alertid: 1,
                    command_line: String::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::UnknownSlot(99)));
    }
}
