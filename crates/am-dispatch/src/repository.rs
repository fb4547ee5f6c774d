//! `AlertStore`: the database adapter trait (spec §4.5). One implementation
//! per supported dialect, selected at startup by a `db_type` configuration
//! value, mirroring the teacher's single-repository-trait-many-backends
//! shape.

use am_common::{Alert, MediaType, MediaTypeId, Result, StatusUpdate, UnixTime};
use async_trait::async_trait;

/// Reads alerts and media types, and flushes buffered status updates. Spec
/// §4.5's "process-lifetime narrowing" behavior — the first `get_alerts`
/// call after process start includes both `new` and `not-sent` rows, every
/// call after that includes only `new` — is implementation state, not part
/// of this trait's contract; each backend owns that flag itself so a
/// restart (a fresh instance) re-widens it.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Read ready alerts as of `now` and atomically promote newly-read `new`
    /// rows to `not-sent`. Returned alerts all have `nextsend == now`.
    async fn get_alerts(&self, now: UnixTime) -> Result<Vec<Alert>>;

    /// Hydrate media type configuration for every distinct `mediatypeid`
    /// referenced by `alerts`, upserting into the caller's in-memory table.
    /// Rows with malformed configuration (e.g. an unparsable SMTP port) are
    /// skipped rather than erroring the whole batch.
    async fn get_media_types(&self, mediatype_ids: &[MediaTypeId]) -> Result<Vec<MediaType>>;

    /// Buffer a status update for later flush. Updates are not visible to
    /// readers until `flush_alert_updates` runs.
    fn buffer_update(&self, update: StatusUpdate);

    /// Write every buffered update in one transaction, sorted by `alertid`
    /// for deadlock avoidance and deterministic ordering, then clear the
    /// buffer. No-op when the buffer is empty.
    async fn flush_alert_updates(&self) -> Result<()>;

    /// Initialize schema (`CREATE TABLE IF NOT EXISTS` and friends).
    async fn init_schema(&self) -> Result<()>;
}
