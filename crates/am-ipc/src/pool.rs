//! Worker slot bookkeeping: registration, free-list, and assignment. Grounded
//! on `original_source/alert_manager.c`'s `am_register_alerter` /
//! `am_get_alerter_by_client` pair — one fixed-size table of slots, one FIFO
//! of free ones.

use am_common::AlertId;
use std::collections::{HashMap, VecDeque};

use crate::error::IpcError;

pub type ClientId = u64;

#[derive(Debug)]
struct WorkerSlot {
    alert: Option<AlertId>,
}

/// The fixed set of worker slots the manager was configured with
/// (`CONFIG_ALERTER_FORKS`, spec §4.6). Registration is one-shot per client:
/// once every slot is filled, a further `REGISTER` is a fatal protocol
/// violation (spec §6/§7), not a retryable condition.
#[derive(Debug)]
pub struct WorkerPool {
    capacity: usize,
    parent_pid: u32,
    slots: HashMap<ClientId, WorkerSlot>,
    free: VecDeque<ClientId>,
}

impl WorkerPool {
    pub fn new(capacity: usize, parent_pid: u32) -> Self {
        Self {
            capacity,
            parent_pid,
            slots: HashMap::with_capacity(capacity),
            free: VecDeque::with_capacity(capacity),
        }
    }

    /// Validate and admit a connecting worker. Refuses a pid mismatch and
    /// refuses admitting past `capacity` — both fatal per spec §6/§7.
    pub fn register(&mut self, client_id: ClientId, pid: u32) -> Result<(), IpcError> {
        if pid != self.parent_pid {
            return Err(IpcError::RegistrationRefused {
                got: pid,
                expected: self.parent_pid,
            });
        }
        if self.slots.len() >= self.capacity {
            return Err(IpcError::OverRegistration(self.capacity));
        }
        self.slots.insert(client_id, WorkerSlot { alert: None });
        self.free.push_back(client_id);
        Ok(())
    }

    /// Pop the next idle worker, if any, without assigning it an alert yet.
    pub fn next_free(&self) -> Option<ClientId> {
        self.free.front().copied()
    }

    /// Assign `alertid` to `client_id`, removing it from the free list.
    pub fn assign(&mut self, client_id: ClientId, alertid: AlertId) -> Result<(), IpcError> {
        let slot = self
            .slots
            .get_mut(&client_id)
            .ok_or(IpcError::UnknownSlot(client_id))?;
        slot.alert = Some(alertid);
        self.free.retain(|id| *id != client_id);
        Ok(())
    }

    /// Mark `client_id`'s slot idle again and return the alert it had been
    /// working on. Called when a `RESULT` arrives.
    pub fn complete(&mut self, client_id: ClientId) -> Result<AlertId, IpcError> {
        let slot = self
            .slots
            .get_mut(&client_id)
            .ok_or(IpcError::UnknownSlot(client_id))?;
        let alertid = slot.alert.take().ok_or(IpcError::UnknownSlot(client_id))?;
        self.free.push_back(client_id);
        Ok(alertid)
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn busy_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn registered_count(&self) -> usize {
        self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_refuses_mismatched_parent_pid() {
        let mut pool = WorkerPool::new(2, 100);
        let err = pool.register(1, 999).unwrap_err();
        assert!(matches!(
            err,
            IpcError::RegistrationRefused {
                got: 999,
                expected: 100
            }
        ));
    }

    #[test]
    fn register_refuses_past_capacity() {
        let mut pool = WorkerPool::new(1, 100);
        pool.register(1, 100).unwrap();
        let err = pool.register(2, 100).unwrap_err();
        assert!(matches!(err, IpcError::OverRegistration(1)));
    }

    #[test]
    fn assign_then_complete_round_trips_through_free_list() {
        let mut pool = WorkerPool::new(2, 100);
        pool.register(1, 100).unwrap();
        pool.register(2, 100).unwrap();
        assert_eq!(pool.free_count(), 2);

        pool.assign(1, 42).unwrap();
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.busy_count(), 1);

        let alertid = pool.complete(1).unwrap();
        assert_eq!(alertid, 42);
        assert_eq!(pool.free_count(), 2);
        assert_eq!(pool.busy_count(), 0);
    }

    #[test]
    fn complete_on_unknown_client_is_unknown_slot() {
        let mut pool = WorkerPool::new(1, 100);
        let err = pool.complete(7).unwrap_err();
        assert!(matches!(err, IpcError::UnknownSlot(7)));
    }

    #[test]
    fn complete_on_idle_slot_is_unknown_slot() {
        let mut pool = WorkerPool::new(1, 100);
        pool.register(1, 100).unwrap();
        let err = pool.complete(1).unwrap_err();
        assert!(matches!(err, IpcError::UnknownSlot(1)));
    }

    #[test]
    fn next_free_is_fifo() {
        let mut pool = WorkerPool::new(3, 100);
        pool.register(1, 100).unwrap();
        pool.register(2, 100).unwrap();
        assert_eq!(pool.next_free(), Some(1));
        pool.assign(1, 1).unwrap();
        assert_eq!(pool.next_free(), Some(2));
    }
}
