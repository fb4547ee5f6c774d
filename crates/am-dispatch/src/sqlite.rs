//! SQLite-backed `AlertStore` (spec §4.5). Grounded on the teacher's
//! `sqlite.rs`: dynamic SQL assembled per call, values bound positionally,
//! `init_schema()` issuing `CREATE TABLE IF NOT EXISTS`.

use std::sync::Mutex;

use am_common::{
    Alert, AlertManagerError, AlertStatus, MediaType, MediaTypeId, MediaTypeKind, Result,
    StatusUpdate, UnixTime,
};
use am_scheduler::calc_alertpoolid;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::repository::AlertStore;

/// Zabbix's `ALERT_TYPE_MESSAGE`: only these rows are this manager's
/// concern (command alerts are dispatched by a different subsystem).
const ALERT_TYPE_MESSAGE: i32 = 0;

pub struct SqliteAlertStore {
    pool: SqlitePool,
    /// Process-lifetime narrowing flag (spec §4.5): `false` until the first
    /// successful `get_alerts`, `true` forever after.
    status_narrowed: Mutex<bool>,
    update_buffer: Mutex<Vec<StatusUpdate>>,
}

impl SqliteAlertStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            status_narrowed: Mutex::new(false),
            update_buffer: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AlertStore for SqliteAlertStore {
    async fn get_alerts(&self, now: UnixTime) -> Result<Vec<Alert>> {
        let include_not_sent = !*self.status_narrowed.lock().unwrap();
        let status_clause = if include_not_sent {
            format!("({}, {})", AlertStatus::New.code(), AlertStatus::NotSent.code())
        } else {
            format!("({})", AlertStatus::New.code())
        };

        let query = format!(
            "SELECT a.alertid, a.mediatypeid, a.sendto, a.subject, a.message, a.status, a.retries, \
                    e.source, e.object, e.objectid \
             FROM alerts a JOIN events e ON e.eventid = a.eventid \
             WHERE a.alerttype = ? AND a.status IN {} AND a.nextsend <= ? \
             ORDER BY a.nextsend ASC, a.alertid ASC",
            status_clause
        );

        let rows = sqlx::query(&query)
            .bind(ALERT_TYPE_MESSAGE)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AlertManagerError::Other(e.into()))?;

        let mut alerts = Vec::with_capacity(rows.len());
        let mut newly_read = Vec::new();
        for row in &rows {
            let alertid: i64 = row.get("alertid");
            let status_code: i32 = row.get("status");
            let status = AlertStatus::from_code(status_code).unwrap_or(AlertStatus::NotSent);
            if status == AlertStatus::New {
                newly_read.push(alertid);
            }

            let objectid: i64 = row.get("objectid");
            let source: i32 = row.get("source");
            let object: i32 = row.get("object");
            let alertpoolid = calc_alertpoolid(objectid as u64, source, object);

            alerts.push(Alert {
                alertid,
                mediatypeid: row.get("mediatypeid"),
                alertpoolid,
                sendto: row.get("sendto"),
                subject: row.get("subject"),
                message: row.get("message"),
                status: AlertStatus::NotSent,
                retries: row.get::<i64, _>("retries") as u32,
                nextsend: now,
            });
        }

        if !newly_read.is_empty() {
            let placeholders = newly_read.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            let promote = format!(
                "UPDATE alerts SET status = ? WHERE alertid IN ({})",
                placeholders
            );
            let mut q = sqlx::query(&promote).bind(AlertStatus::NotSent.code());
            for id in &newly_read {
                q = q.bind(id);
            }
            q.execute(&self.pool)
                .await
                .map_err(|e| AlertManagerError::Other(e.into()))?;
        }

        *self.status_narrowed.lock().unwrap() = true;
        debug!(count = alerts.len(), "fetched ready alerts");
        Ok(alerts)
    }

    async fn get_media_types(&self, mediatype_ids: &[MediaTypeId]) -> Result<Vec<MediaType>> {
        if mediatype_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = mediatype_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let query = format!(
            "SELECT mediatypeid, type, maxsessions, maxattempts, attempt_interval, \
                    smtp_server, smtp_port, smtp_helo, smtp_email, smtp_security, \
                    smtp_verify_peer, smtp_verify_host, smtp_authentication, \
                    username, passwd, gsm_modem, endpoint_path, exec_path, exec_params \
             FROM media_type WHERE mediatypeid IN ({})",
            placeholders
        );

        let mut q = sqlx::query(&query);
        for id in mediatype_ids {
            q = q.bind(id);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AlertManagerError::Other(e.into()))?;

        let mut media_types = Vec::with_capacity(rows.len());
        for row in &rows {
            let mediatypeid: i64 = row.get("mediatypeid");
            let port_text: String = row.get("smtp_port");
            let smtp_port: u16 = match port_text.parse() {
                Ok(p) => p,
                Err(_) => {
                    warn!(mediatypeid, smtp_port = %port_text, "malformed smtp_port, skipping media type");
                    continue;
                }
            };

            media_types.push(MediaType {
                mediatypeid,
                kind: MediaTypeKind::from_code(row.get("type")),
                maxsessions: row.get::<i64, _>("maxsessions") as u32,
                maxattempts: row.get::<i64, _>("maxattempts") as u32,
                attempt_interval_secs: row.get::<i64, _>("attempt_interval") as u32,
                smtp_server: row.get("smtp_server"),
                smtp_port,
                smtp_helo: row.get("smtp_helo"),
                smtp_email: row.get("smtp_email"),
                smtp_security: row.get("smtp_security"),
                smtp_verify_peer: row.get::<i64, _>("smtp_verify_peer") != 0,
                smtp_verify_host: row.get::<i64, _>("smtp_verify_host") != 0,
                smtp_authentication: row.get::<i64, _>("smtp_authentication") != 0,
                username: row.get("username"),
                passwd: row.get("passwd"),
                gsm_modem: row.get("gsm_modem"),
                endpoint_path: row.get("endpoint_path"),
                exec_path: row.get("exec_path"),
                exec_params: row.get("exec_params"),
            });
        }

        Ok(media_types)
    }

    fn buffer_update(&self, update: StatusUpdate) {
        self.update_buffer.lock().unwrap().push(update);
    }

    async fn flush_alert_updates(&self) -> Result<()> {
        let mut updates = std::mem::take(&mut *self.update_buffer.lock().unwrap());
        if updates.is_empty() {
            return Ok(());
        }
        updates.sort_by_key(|u| u.alertid);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AlertManagerError::Other(e.into()))?;
        for update in &updates {
            sqlx::query("UPDATE alerts SET status = ?, retries = ?, error = ? WHERE alertid = ?")
                .bind(update.status.code())
                .bind(update.retries as i64)
                .bind(&update.error)
                .bind(update.alertid)
                .execute(&mut *tx)
                .await
                .map_err(|e| AlertManagerError::Other(e.into()))?;
        }
        tx.commit().await.map_err(|e| AlertManagerError::Other(e.into()))?;

        debug!(count = updates.len(), "flushed alert status updates");
        Ok(())
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                eventid INTEGER PRIMARY KEY,
                source INTEGER NOT NULL,
                object INTEGER NOT NULL,
                objectid INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AlertManagerError::Other(e.into()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                alertid INTEGER PRIMARY KEY,
                eventid INTEGER NOT NULL,
                mediatypeid INTEGER NOT NULL,
                alerttype INTEGER NOT NULL DEFAULT 0,
                sendto TEXT NOT NULL,
                subject TEXT NOT NULL,
                message TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                retries INTEGER NOT NULL DEFAULT 0,
                error TEXT NOT NULL DEFAULT '',
                nextsend INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_status ON alerts(status);
            CREATE INDEX IF NOT EXISTS idx_alerts_nextsend ON alerts(nextsend);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AlertManagerError::Other(e.into()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media_type (
                mediatypeid INTEGER PRIMARY KEY,
                type INTEGER NOT NULL,
                maxsessions INTEGER NOT NULL DEFAULT 1,
                maxattempts INTEGER NOT NULL DEFAULT 3,
                attempt_interval INTEGER NOT NULL DEFAULT 10,
                smtp_server TEXT NOT NULL DEFAULT '',
                smtp_port TEXT NOT NULL DEFAULT '25',
                smtp_helo TEXT NOT NULL DEFAULT '',
                smtp_email TEXT NOT NULL DEFAULT '',
                smtp_security TEXT NOT NULL DEFAULT '',
                smtp_verify_peer INTEGER NOT NULL DEFAULT 0,
                smtp_verify_host INTEGER NOT NULL DEFAULT 0,
                smtp_authentication INTEGER NOT NULL DEFAULT 0,
                username TEXT NOT NULL DEFAULT '',
                passwd TEXT NOT NULL DEFAULT '',
                gsm_modem TEXT NOT NULL DEFAULT '',
                endpoint_path TEXT NOT NULL DEFAULT '',
                exec_path TEXT NOT NULL DEFAULT '',
                exec_params TEXT NOT NULL DEFAULT ''
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AlertManagerError::Other(e.into()))?;

        info!("initialized sqlite alert-manager schema");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_common::AlertStatus;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> SqliteAlertStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteAlertStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    async fn seed_event(store: &SqliteAlertStore, eventid: i64, source: i32, object: i32, objectid: i64) {
        sqlx::query("INSERT INTO events (eventid, source, object, objectid) VALUES (?, ?, ?, ?)")
            .bind(eventid)
            .bind(source)
            .bind(object)
            .bind(objectid)
            .execute(&store.pool)
            .await
            .unwrap();
    }

    async fn seed_alert(store: &SqliteAlertStore, alertid: i64, eventid: i64, mediatypeid: i64, status: AlertStatus) {
        sqlx::query(
            "INSERT INTO alerts (alertid, eventid, mediatypeid, alerttype, sendto, subject, message, status, nextsend) \
             VALUES (?, ?, ?, 0, 'a@b.com', 'subj', 'msg', ?, 0)",
        )
        .bind(alertid)
        .bind(eventid)
        .bind(mediatypeid)
        .bind(status.code())
        .execute(&store.pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn first_call_includes_new_and_not_sent_second_call_new_only() {
        let store = setup().await;
        seed_event(&store, 1, 0, 0, 100).await;
        seed_alert(&store, 1, 1, 1, AlertStatus::New).await;
        seed_alert(&store, 2, 1, 1, AlertStatus::NotSent).await;

        let first = store.get_alerts(1000).await.unwrap();
        assert_eq!(first.len(), 2);

        // New alert should now be promoted to not-sent in storage.
        seed_event(&store, 2, 0, 0, 200).await;
        seed_alert(&store, 3, 2, 1, AlertStatus::New).await;
        let second = store.get_alerts(1000).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].alertid, 3);
    }

    #[tokio::test]
    async fn alertpoolid_is_derived_from_event_fields() {
        let store = setup().await;
        seed_event(&store, 1, 5, 6, 777).await;
        seed_alert(&store, 1, 1, 1, AlertStatus::New).await;
        let alerts = store.get_alerts(1000).await.unwrap();
        assert_eq!(alerts[0].alertpoolid, calc_alertpoolid(777, 5, 6));
    }

    #[tokio::test]
    async fn flush_applies_sorted_updates_and_clears_buffer() {
        let store = setup().await;
        seed_event(&store, 1, 0, 0, 1).await;
        seed_alert(&store, 1, 1, 1, AlertStatus::New).await;

        store.buffer_update(StatusUpdate {
            alertid: 1,
            status: AlertStatus::Sent,
            retries: 0,
            error: String::new(),
        });
        store.flush_alert_updates().await.unwrap();
        assert!(store.update_buffer.lock().unwrap().is_empty());

        let row = sqlx::query("SELECT status FROM alerts WHERE alertid = 1")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let status: i64 = row.get("status");
        assert_eq!(status, AlertStatus::Sent.code() as i64);
    }

    #[tokio::test]
    async fn flush_on_empty_buffer_is_noop() {
        let store = setup().await;
        store.flush_alert_updates().await.unwrap();
    }
}
