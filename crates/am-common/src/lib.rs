//! Shared domain types for the alert manager: alerts, media types, status
//! updates, and the error type threaded through every other crate in this
//! workspace.

pub mod logging;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Unix seconds. Kept as a plain integer (not `chrono::DateTime`) because the
/// scheduler only ever compares and adds to it; pulling in calendar
/// arithmetic here would be the wrong tool for a monotonic epoch clock.
pub type UnixTime = i64;

pub type AlertId = i64;
pub type MediaTypeId = i64;

/// A 64-bit hash of `(event_source, event_object, event_objectid)`. Two
/// alerts with identical grouping fields must produce the identical
/// `AlertPoolId` across process restarts.
pub type AlertPoolId = u64;

/// Lifecycle state of an alert row, mirrored to the `alerts.status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    New,
    NotSent,
    Sent,
    Failed,
}

impl AlertStatus {
    /// Numeric code matching the database schema's integer status column.
    pub fn code(self) -> i32 {
        match self {
            AlertStatus::New => 0,
            AlertStatus::NotSent => 1,
            AlertStatus::Sent => 2,
            AlertStatus::Failed => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(AlertStatus::New),
            1 => Some(AlertStatus::NotSent),
            2 => Some(AlertStatus::Sent),
            3 => Some(AlertStatus::Failed),
            _ => None,
        }
    }
}

/// The delivery channel kind, selecting which field tuple `am-ipc` serializes
/// for the worker and which outbound IPC command name is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaTypeKind {
    Email,
    Xmpp,
    Sms,
    TextGateway,
    Exec,
    /// Any database value this build does not recognize. Dispatch against a
    /// media type in this state fails immediately with "unsupported media
    /// type" (spec scenario S5) rather than panicking.
    Unsupported(i32),
}

impl MediaTypeKind {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => MediaTypeKind::Email,
            1 => MediaTypeKind::Xmpp,
            2 => MediaTypeKind::Sms,
            3 => MediaTypeKind::TextGateway,
            4 => MediaTypeKind::Exec,
            other => MediaTypeKind::Unsupported(other),
        }
    }
}

/// One delivery attempt for one recipient on one media type. See spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alertid: AlertId,
    pub mediatypeid: MediaTypeId,
    pub alertpoolid: AlertPoolId,
    pub sendto: String,
    pub subject: String,
    pub message: String,
    pub status: AlertStatus,
    pub retries: u32,
    pub nextsend: UnixTime,
}

/// Transport-specific configuration plus the scheduler's bookkeeping for one
/// media type row. The scheduler fields (`alerts_num`, heap membership) live
/// on `am_scheduler::scheduler::MediaTypeEntry`, not here — this struct is
/// the immutable-per-poll-cycle configuration snapshot hydrated from the
/// database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaType {
    pub mediatypeid: MediaTypeId,
    pub kind: MediaTypeKind,
    pub maxsessions: u32,
    pub maxattempts: u32,
    pub attempt_interval_secs: u32,

    // Email
    pub smtp_server: String,
    pub smtp_port: u16,
    pub smtp_helo: String,
    pub smtp_email: String,
    pub smtp_security: String,
    pub smtp_verify_peer: bool,
    pub smtp_verify_host: bool,
    pub smtp_authentication: bool,

    // XMPP / SMS / text-gateway shared credential fields
    pub username: String,
    pub passwd: String,

    // SMS
    pub gsm_modem: String,

    // text-gateway
    pub endpoint_path: String,

    // EXEC
    pub exec_path: String,
    pub exec_params: String,
}

impl MediaType {
    /// `maxsessions == 0` means unlimited in-flight alerts (spec §8 boundary
    /// behavior).
    pub fn is_unlimited(&self) -> bool {
        self.maxsessions == 0
    }
}

/// A buffered intent to write `(alertid, status, retries, error)` to the
/// store at the next flush (spec §3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub alertid: AlertId,
    pub status: AlertStatus,
    pub retries: u32,
    pub error: String,
}

/// Raw row shape joined out of `events` for alert-pool derivation (spec §6).
#[derive(Debug, Clone, Copy)]
pub struct EventKey {
    pub source: i32,
    pub object: i32,
    pub objectid: u64,
}

/// Outcome reported by a worker for the alert currently occupying its slot
/// (spec §4.4, §4.6 `RESULT`).
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub alertid: AlertId,
    pub ok: bool,
    pub errmsg: String,
}

pub type Result<T> = std::result::Result<T, AlertManagerError>;

#[derive(Error, Debug)]
pub enum AlertManagerError {
    #[error("media type {0} not found")]
    MediaTypeNotFound(MediaTypeId),

    #[error("alert pool ({0}, {1}) not found")]
    AlertPoolNotFound(MediaTypeId, AlertPoolId),

    #[error("unsupported media type (code {0})")]
    UnsupportedMediaType(i32),

    #[error("script not executable: {0}")]
    ScriptNotExecutable(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Truncate `s` to at most `max_len` bytes on a char boundary, matching the
/// store's `ALERT_ERROR_LEN` column width (spec §6).
pub fn truncate_error(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Single-quote-escape a string for embedding in a SQL statement, per dialect
/// convention: double any embedded single quote.
pub fn sql_quote_escape(s: &str) -> String {
    s.replace('\'', "''")
}

#[derive(Debug, Default)]
pub struct StatInterval {
    pub sent: u64,
    pub failed: u64,
    pub idle_ms: u64,
}

impl StatInterval {
    pub fn reset(&mut self) {
        self.sent = 0;
        self.failed = 0;
        self.idle_ms = 0;
    }
}

/// Macro substitution for EXEC parameter templates (spec §9): an external
/// capability in the original system, modeled here as a trait so `am-ipc`
/// can depend on it without depending on a concrete implementation. The
/// identity implementation (no `{sendto,subject,message}` tokens present)
/// must be idempotent.
pub trait MacroExpander: Send + Sync {
    fn expand(&self, template: &str, alert: &Alert) -> String;
}

/// The trivial macro expander: substitutes `{sendto}`, `{subject}`,
/// `{message}` verbatim and nothing else, matching spec §9's contract.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMacroExpander;

impl MacroExpander for DefaultMacroExpander {
    fn expand(&self, template: &str, alert: &Alert) -> String {
        template
            .replace("{sendto}", &alert.sendto)
            .replace("{subject}", &alert.subject)
            .replace("{message}", &alert.message)
    }
}

/// Distinct media type ids referenced by a batch of alerts, used by
/// `db_update_mediatypes` (spec §4.5) to know which rows to hydrate.
pub fn distinct_mediatype_ids(alerts: &[Alert]) -> Vec<MediaTypeId> {
    let mut seen = HashMap::new();
    let mut ids = Vec::new();
    for a in alerts {
        if seen.insert(a.mediatypeid, ()).is_none() {
            ids.push(a.mediatypeid);
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_round_trips() {
        for s in [
            AlertStatus::New,
            AlertStatus::NotSent,
            AlertStatus::Sent,
            AlertStatus::Failed,
        ] {
            assert_eq!(AlertStatus::from_code(s.code()), Some(s));
        }
    }

    #[test]
    fn truncate_error_respects_char_boundaries() {
        let s = "héllo world"; // 'é' is 2 bytes
        let truncated = truncate_error(s, 2);
        assert!(truncated.len() <= 2);
        assert!(std::str::from_utf8(truncated.as_bytes()).is_ok());
    }

    #[test]
    fn truncate_error_noop_when_short() {
        assert_eq!(truncate_error("short", 100), "short");
    }

    #[test]
    fn macro_expander_is_idempotent_without_tokens() {
        let alert = Alert {
            alertid: 1,
            mediatypeid: 1,
            alertpoolid: 0,
            sendto: "a@b.com".into(),
            subject: "s".into(),
            message: "m".into(),
            status: AlertStatus::New,
            retries: 0,
            nextsend: 0,
        };
        let expander = DefaultMacroExpander;
        let plain = "/usr/local/bin/notify.sh";
        assert_eq!(expander.expand(plain, &alert), plain);
    }

    #[test]
    fn macro_expander_substitutes_known_fields() {
        let alert = Alert {
            alertid: 1,
            mediatypeid: 1,
            alertpoolid: 0,
            sendto: "+15551234567".into(),
            subject: "subj".into(),
            message: "body text".into(),
            status: AlertStatus::New,
            retries: 0,
            nextsend: 0,
        };
        let expander = DefaultMacroExpander;
        let out = expander.expand("{sendto}|{subject}|{message}", &alert);
        assert_eq!(out, "+15551234567|subj|body text");
    }

    #[test]
    fn distinct_mediatype_ids_preserves_first_seen_order() {
        let mk = |id: MediaTypeId| Alert {
            alertid: 0,
            mediatypeid: id,
            alertpoolid: 0,
            sendto: String::new(),
            subject: String::new(),
            message: String::new(),
            status: AlertStatus::New,
            retries: 0,
            nextsend: 0,
        };
        let alerts = vec![mk(3), mk(1), mk(3), mk(2)];
        assert_eq!(distinct_mediatype_ids(&alerts), vec![3, 1, 2]);
    }
}
