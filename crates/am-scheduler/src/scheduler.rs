//! The three-level scheduler (spec §4.2, §4.3): manager queue of media
//! types, each media type's queue of alert pools, each pool's queue of
//! alerts. This is the core described in SPEC_FULL.md §2 item 3 — the
//! placement/removal rules that keep every parent heap's key consistent
//! with its children's current minimum, and that enforce the per-media-type
//! concurrency cap (`maxsessions`).

use std::collections::HashMap;

use am_common::{Alert, AlertId, AlertPoolId, MediaType, MediaTypeId, UnixTime};
use thiserror::Error;
use tracing::debug;

use crate::heap::{DirectHeap, PlainHeap};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("media type {0} not found")]
    MediaTypeNotFound(MediaTypeId),
}

/// Outcome of `retry_alert` (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The alert was re-placed and will be attempted again at `nextsend`.
    Requeued,
    /// `maxattempts` was reached; the alert was removed from the scheduler.
    Exhausted,
}

/// An alert pool: the FIFO-ish bucket serializing alerts sharing
/// `(mediatypeid, alertpoolid)` (spec §3).
#[derive(Debug)]
struct AlertPoolEntry {
    alerts: PlainHeap<Alert>,
}

impl AlertPoolEntry {
    fn new() -> Self {
        Self {
            alerts: PlainHeap::new(),
        }
    }

    fn min_nextsend(&self) -> Option<UnixTime> {
        self.alerts.peek_min().map(|(k, _)| k)
    }
}

/// A media type's scheduler-owned state: its pool heap and in-flight count.
/// The transport configuration itself (`MediaType`) is hydrated separately
/// by the database adapter (spec §4.5) and stored alongside.
#[derive(Debug)]
struct MediaTypeEntry {
    config: MediaType,
    /// Keyed by `alertpoolid`; sort key is that pool's current min alert's
    /// `nextsend`.
    pools: DirectHeap<AlertPoolId, ()>,
    /// Count of alerts popped for dispatch and not yet completed (spec I4).
    alerts_num: u32,
}

impl MediaTypeEntry {
    fn new(config: MediaType) -> Self {
        Self {
            config,
            pools: DirectHeap::new(),
            alerts_num: 0,
        }
    }

    fn has_capacity(&self) -> bool {
        self.config.is_unlimited() || self.alerts_num < self.config.maxsessions
    }
}

/// The scheduler: the manager heap of media types, the media-type table, and
/// the alert-pool entity table (spec §4.2).
#[derive(Debug, Default)]
pub struct Scheduler {
    mediatypes: HashMap<MediaTypeId, MediaTypeEntry>,
    alertpools: HashMap<(MediaTypeId, AlertPoolId), AlertPoolEntry>,
    /// Keyed by `mediatypeid`; sort key is that media type's current min
    /// pool's min alert's `nextsend`.
    manager: DirectHeap<MediaTypeId, ()>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh the configuration for a media type. Existing
    /// scheduler state (pools, alerts_num) is preserved if the media type is
    /// already known; only `config` is replaced. Called by
    /// `db_update_mediatypes` (spec §4.5).
    pub fn upsert_mediatype(&mut self, config: MediaType) {
        match self.mediatypes.get_mut(&config.mediatypeid) {
            Some(entry) => entry.config = config,
            None => {
                self.mediatypes
                    .insert(config.mediatypeid, MediaTypeEntry::new(config));
            }
        }
    }

    pub fn has_mediatype(&self, mediatypeid: MediaTypeId) -> bool {
        self.mediatypes.contains_key(&mediatypeid)
    }

    pub fn mediatype_config(&self, mediatypeid: MediaTypeId) -> Option<&MediaType> {
        self.mediatypes.get(&mediatypeid).map(|e| &e.config)
    }

    /// Current `alerts_num` for a media type, 0 if unknown (used by tests
    /// and metrics, spec §8 "sum over M of alerts_num == busy slots").
    pub fn alerts_num(&self, mediatypeid: MediaTypeId) -> u32 {
        self.mediatypes
            .get(&mediatypeid)
            .map(|e| e.alerts_num)
            .unwrap_or(0)
    }

    pub fn total_alerts_num(&self) -> u32 {
        self.mediatypes.values().map(|e| e.alerts_num).sum()
    }

    // ---- §4.3 push/pop/remove/retry -----------------------------------

    /// `push_alert(pool, alert)`: insert alert into its pool's heap. Creates
    /// the pool entry if absent. Caller must follow with `push_alertpool`.
    pub fn push_alert(&mut self, alert: Alert) {
        let key = (alert.mediatypeid, alert.alertpoolid);
        let pool = self.alertpools.entry(key).or_insert_with(AlertPoolEntry::new);
        pool.alerts.insert(alert.nextsend, alert);
    }

    /// `push_alertpool(mediatype, pool)`: insert or reposition `pool` in its
    /// media type's pool heap, keyed by the pool's current min alert.
    /// No-op (the pool simply never enters the heap) if the pool's alert
    /// heap is empty — nothing to schedule.
    pub fn push_alertpool(&mut self, mediatypeid: MediaTypeId, alertpoolid: AlertPoolId) {
        let Some(min_nextsend) = self
            .alertpools
            .get(&(mediatypeid, alertpoolid))
            .and_then(|p| p.min_nextsend())
        else {
            return;
        };
        let Some(mt) = self.mediatypes.get_mut(&mediatypeid) else {
            return;
        };
        if mt.pools.contains(&alertpoolid) {
            mt.pools.update(alertpoolid, min_nextsend);
        } else {
            mt.pools.insert(alertpoolid, min_nextsend, ());
        }
    }

    /// `push_mediatype(manager, mediatype)`: insert or reposition a media
    /// type in the manager heap, respecting the `maxsessions` cap (spec
    /// §4.3). No-op if the media type's pool heap is empty.
    pub fn push_mediatype(&mut self, mediatypeid: MediaTypeId) {
        let Some(mt) = self.mediatypes.get(&mediatypeid) else {
            return;
        };
        let Some((_, min_nextsend, _)) = mt.pools.peek_min() else {
            return;
        };
        if self.manager.contains(&mediatypeid) {
            self.manager.update(mediatypeid, min_nextsend);
        } else if mt.has_capacity() {
            self.manager.insert(mediatypeid, min_nextsend, ());
        }
        // else: leave un-queued; re-pushed when alerts_num decreases.
    }

    /// `check_queue(now) → bool`: peek all three levels without popping.
    pub fn check_queue(&self, now: UnixTime) -> bool {
        let Some((mediatypeid, _, _)) = self.manager.peek_min() else {
            return false;
        };
        let Some(mt) = self.mediatypes.get(mediatypeid) else {
            return false;
        };
        let Some((alertpoolid, _, _)) = mt.pools.peek_min() else {
            return false;
        };
        let Some(pool) = self.alertpools.get(&(*mediatypeid, *alertpoolid)) else {
            return false;
        };
        match pool.min_nextsend() {
            Some(nextsend) => nextsend <= now,
            None => false,
        }
    }

    /// `pop_alert()`: the sole dispatch-loop entry point (spec §4.3).
    /// Returns `None` if the manager heap is empty.
    pub fn pop_alert(&mut self) -> Option<Alert> {
        let (mediatypeid, _, _) = self.manager.pop_min()?;
        let mt = self
            .mediatypes
            .get_mut(&mediatypeid)
            .expect("media type present in manager heap must exist in table");
        let (alertpoolid, _, _) = mt.pools.pop_min()?;
        let pool = self
            .alertpools
            .get_mut(&(mediatypeid, alertpoolid))
            .expect("pool present in media type heap must exist in table");
        let (_, alert) = pool.alerts.pop_min()?;

        mt.alerts_num += 1;
        debug!(mediatypeid, alertpoolid, alertid = alert.alertid, alerts_num = mt.alerts_num, "popped alert for dispatch");

        // P is deliberately NOT re-pushed here: at-most-one in-flight alert
        // per pool is enforced by leaving the pool absent from the media
        // type's heap until remove_alert/retry_alert re-push it.
        if mt.has_capacity() {
            self.push_mediatype(mediatypeid);
        }

        Some(alert)
    }

    /// `remove_alert(alert)`: terminal outcome (delivered, or permanently
    /// failed outside the retry state machine, e.g. unsupported media type).
    pub fn remove_alert(&mut self, alert: &Alert) {
        let Some(mt) = self.mediatypes.get_mut(&alert.mediatypeid) else {
            // Defensive: media type vanished underneath us (spec §4.3 step 1).
            return;
        };
        mt.alerts_num = mt.alerts_num.saturating_sub(1);

        let pool_key = (alert.mediatypeid, alert.alertpoolid);
        let pool_empty = self
            .alertpools
            .get(&pool_key)
            .map(|p| p.alerts.is_empty())
            .unwrap_or(true);

        if pool_empty {
            self.alertpools.remove(&pool_key);
        } else {
            self.push_alertpool(alert.mediatypeid, alert.alertpoolid);
        }

        let mt = self.mediatypes.get(&alert.mediatypeid).unwrap();
        if mt.pools.is_empty() && mt.alerts_num == 0 {
            self.mediatypes.remove(&alert.mediatypeid);
            self.manager.remove(&alert.mediatypeid);
        } else {
            self.push_mediatype(alert.mediatypeid);
        }
    }

    /// `retry_alert(alert, now)`: transient failure (spec §4.3). `alert` is
    /// consumed and either exhausted (terminal) or re-placed at
    /// `now + attempt_interval`. Returns the outcome and, on success, the
    /// (possibly mutated) alert for the caller to snapshot into a status
    /// update.
    pub fn retry_alert(&mut self, mut alert: Alert, now: UnixTime) -> (RetryOutcome, Alert) {
        let Some(mt) = self.mediatypes.get(&alert.mediatypeid) else {
            // Absent media type: treat as remove (nothing left to retry into).
            return (RetryOutcome::Exhausted, alert);
        };
        let maxattempts = mt.config.maxattempts;
        let attempt_interval = mt.config.attempt_interval_secs as i64;

        alert.retries += 1;
        if alert.retries >= maxattempts {
            self.remove_alert(&alert);
            return (RetryOutcome::Exhausted, alert);
        }

        alert.nextsend = now + attempt_interval;

        let mt = self.mediatypes.get_mut(&alert.mediatypeid).unwrap();
        mt.alerts_num = mt.alerts_num.saturating_sub(1);

        // Look up or recreate the pool. In steady-state operation the pool
        // entry still exists from `pop_alert` (it is only ever removed by
        // `remove_alert` when its heap empties), but the recreate path is
        // kept reachable and tested defensively (spec §9 open question).
        self.alertpools
            .entry((alert.mediatypeid, alert.alertpoolid))
            .or_insert_with(AlertPoolEntry::new);

        self.push_alert(alert.clone());
        self.push_alertpool(alert.mediatypeid, alert.alertpoolid);
        self.push_mediatype(alert.mediatypeid);

        (RetryOutcome::Requeued, alert)
    }

    #[cfg(test)]
    fn pool_exists(&self, mediatypeid: MediaTypeId, alertpoolid: AlertPoolId) -> bool {
        self.alertpools.contains_key(&(mediatypeid, alertpoolid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_common::{AlertStatus, MediaTypeKind};

    fn mt(id: MediaTypeId, maxsessions: u32, maxattempts: u32, attempt_interval: u32) -> MediaType {
        MediaType {
            mediatypeid: id,
            kind: MediaTypeKind::Email,
            maxsessions,
            maxattempts,
            attempt_interval_secs: attempt_interval,
            smtp_server: String::new(),
            smtp_port: 25,
            smtp_helo: String::new(),
            smtp_email: String::new(),
            smtp_security: String::new(),
            smtp_verify_peer: false,
            smtp_verify_host: false,
            smtp_authentication: false,
            username: String::new(),
            passwd: String::new(),
            gsm_modem: String::new(),
            endpoint_path: String::new(),
            exec_path: String::new(),
            exec_params: String::new(),
        }
    }

    fn alert(alertid: AlertId, mediatypeid: MediaTypeId, alertpoolid: AlertPoolId, nextsend: UnixTime) -> Alert {
        Alert {
            alertid,
            mediatypeid,
            alertpoolid,
            sendto: "x".into(),
            subject: "s".into(),
            message: "m".into(),
            status: AlertStatus::NotSent,
            retries: 0,
            nextsend,
        }
    }

    fn seed(sched: &mut Scheduler, a: Alert) {
        sched.push_alert(a.clone());
        sched.push_alertpool(a.mediatypeid, a.alertpoolid);
        sched.push_mediatype(a.mediatypeid);
    }

    #[test]
    fn s1_single_happy_path() {
        let mut sched = Scheduler::new();
        sched.upsert_mediatype(mt(1, 0, 3, 60));
        seed(&mut sched, alert(1, 1, 100, 0));

        assert!(sched.check_queue(0));
        let popped = sched.pop_alert().expect("alert ready");
        assert_eq!(popped.alertid, 1);
        assert_eq!(sched.alerts_num(1), 1);

        sched.remove_alert(&popped);
        assert_eq!(sched.alerts_num(1), 0);
        assert!(!sched.has_mediatype(1), "media type destroyed once empty");
        assert!(!sched.check_queue(0));
    }

    #[test]
    fn s2_per_pool_serialization() {
        let mut sched = Scheduler::new();
        sched.upsert_mediatype(mt(1, 5, 3, 60));
        seed(&mut sched, alert(1, 1, 100, 0));
        seed(&mut sched, alert(2, 1, 100, 0));
        seed(&mut sched, alert(3, 1, 100, 0));

        let a1 = sched.pop_alert().unwrap();
        // Pool is not re-queued until a1 completes: nothing else pops.
        assert!(sched.pop_alert().is_none());

        sched.remove_alert(&a1);
        let a2 = sched.pop_alert().expect("pool re-queued after completion");
        assert_ne!(a2.alertid, a1.alertid);
        assert!(sched.pop_alert().is_none());
    }

    #[test]
    fn s3_per_mediatype_cap() {
        let mut sched = Scheduler::new();
        sched.upsert_mediatype(mt(1, 2, 3, 60));
        for i in 0..10u64 {
            seed(&mut sched, alert(i as i64 + 1, 1, i, 0));
        }

        let first = sched.pop_alert().unwrap();
        let second = sched.pop_alert().unwrap();
        assert!(sched.pop_alert().is_none(), "cap of 2 reached");
        assert_eq!(sched.alerts_num(1), 2);

        sched.remove_alert(&first);
        assert!(sched.pop_alert().is_some(), "next pool advances after completion");
        sched.remove_alert(&second);
    }

    #[test]
    fn s4_retry_with_backoff() {
        let mut sched = Scheduler::new();
        sched.upsert_mediatype(mt(1, 0, 3, 60));
        seed(&mut sched, alert(1, 1, 100, 0));

        let a1 = sched.pop_alert().unwrap();
        let (outcome, a1) = sched.retry_alert(a1, 100);
        assert_eq!(outcome, RetryOutcome::Requeued);
        assert_eq!(a1.retries, 1);
        assert_eq!(a1.nextsend, 160);

        assert!(!sched.check_queue(159));
        assert!(sched.check_queue(160));

        let a1 = sched.pop_alert().unwrap();
        let (outcome, a1) = sched.retry_alert(a1, 160);
        assert_eq!(outcome, RetryOutcome::Requeued);
        assert_eq!(a1.retries, 2);

        let a1 = sched.pop_alert().unwrap();
        let (outcome, a1) = sched.retry_alert(a1, 220);
        assert_eq!(outcome, RetryOutcome::Exhausted);
        assert_eq!(a1.retries, 3);
        assert!(!sched.has_mediatype(1));
    }

    #[test]
    fn s6_pool_id_collision_determinism() {
        // Exercised at the am-scheduler level by checking two alerts with
        // the same alertpoolid land in the same pool and pop in FIFO order.
        let mut sched = Scheduler::new();
        sched.upsert_mediatype(mt(1, 0, 3, 60));
        seed(&mut sched, alert(1, 1, 999, 0));
        seed(&mut sched, alert(2, 1, 999, 0));
        seed(&mut sched, alert(3, 1, 555, 0));

        let first = sched.pop_alert().unwrap();
        assert_eq!(first.alertpoolid, 999, "earliest pool (by insertion among equal nextsend) dispatches first");
    }

    #[test]
    fn maxsessions_zero_is_unlimited() {
        let mut sched = Scheduler::new();
        sched.upsert_mediatype(mt(1, 0, 3, 60));
        for i in 0..1000u64 {
            seed(&mut sched, alert(i as i64 + 1, 1, i, 0));
        }
        let mut popped = 0;
        while let Some(a) = sched.pop_alert() {
            popped += 1;
            sched.remove_alert(&a);
        }
        assert_eq!(popped, 1000);
    }

    #[test]
    fn maxattempts_one_is_terminal_on_first_failure() {
        let mut sched = Scheduler::new();
        sched.upsert_mediatype(mt(1, 0, 1, 60));
        seed(&mut sched, alert(1, 1, 1, 0));
        let a1 = sched.pop_alert().unwrap();
        let (outcome, _) = sched.retry_alert(a1, 0);
        assert_eq!(outcome, RetryOutcome::Exhausted);
    }

    #[test]
    fn empty_pool_heap_with_inflight_alert_keeps_mediatype_out_of_manager() {
        let mut sched = Scheduler::new();
        sched.upsert_mediatype(mt(1, 0, 3, 60));
        seed(&mut sched, alert(1, 1, 1, 0));
        let a1 = sched.pop_alert().unwrap();

        assert!(sched.has_mediatype(1));
        assert_eq!(sched.alerts_num(1), 1);
        assert!(!sched.check_queue(0), "nothing queued at the manager level while the only alert is in flight");

        sched.remove_alert(&a1);
    }

    #[test]
    fn retry_recreates_destroyed_pool() {
        // Defensive path (spec §9 open question #3): force the pool entry
        // to not exist, then confirm retry_alert recreates it rather than
        // panicking or silently dropping the alert.
        let mut sched = Scheduler::new();
        sched.upsert_mediatype(mt(1, 0, 3, 60));
        let a1 = alert(1, 1, 42, 0);

        assert!(!sched.pool_exists(1, 42));
        let (outcome, requeued) = sched.retry_alert(a1, 0);
        assert_eq!(outcome, RetryOutcome::Requeued);
        assert!(sched.pool_exists(1, 42));
        assert!(sched.check_queue(requeued.nextsend));
    }

    #[test]
    fn push_alertpool_is_idempotent_for_same_min() {
        let mut sched = Scheduler::new();
        sched.upsert_mediatype(mt(1, 0, 3, 60));
        seed(&mut sched, alert(1, 1, 1, 50));
        sched.push_alertpool(1, 1);
        sched.push_alertpool(1, 1);
        assert!(sched.check_queue(50));
        let a = sched.pop_alert().unwrap();
        assert_eq!(a.alertid, 1);
    }

    #[test]
    fn flushing_no_update_buffer_here_is_a_scheduler_noop() {
        // The update buffer itself lives in am-dispatch; this test only
        // confirms the scheduler has no implicit side effects when nothing
        // is queued.
        let sched = Scheduler::new();
        assert!(!sched.check_queue(i64::MAX));
        assert_eq!(sched.total_alerts_num(), 0);
    }
}
