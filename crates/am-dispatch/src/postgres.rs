//! PostgreSQL-backed `AlertStore` (spec §4.5): the same SQL shape as
//! `sqlite.rs`, using `$n` placeholders instead of `?` and an `ANY($1)`
//! array bind for IN-clauses instead of per-id placeholders.

use std::sync::Mutex;

use am_common::{
    Alert, AlertManagerError, AlertStatus, MediaType, MediaTypeId, MediaTypeKind, Result,
    StatusUpdate, UnixTime,
};
use am_scheduler::calc_alertpoolid;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};

use crate::repository::AlertStore;

const ALERT_TYPE_MESSAGE: i32 = 0;

pub struct PostgresAlertStore {
    pool: PgPool,
    status_narrowed: Mutex<bool>,
    update_buffer: Mutex<Vec<StatusUpdate>>,
}

impl PostgresAlertStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            status_narrowed: Mutex::new(false),
            update_buffer: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AlertStore for PostgresAlertStore {
    async fn get_alerts(&self, now: UnixTime) -> Result<Vec<Alert>> {
        let include_not_sent = !*self.status_narrowed.lock().unwrap();
        let statuses: Vec<i32> = if include_not_sent {
            vec![AlertStatus::New.code(), AlertStatus::NotSent.code()]
        } else {
            vec![AlertStatus::New.code()]
        };

        let rows = sqlx::query(
            "SELECT a.alertid, a.mediatypeid, a.sendto, a.subject, a.message, a.status, a.retries, \
                    e.source, e.object, e.objectid \
             FROM alerts a JOIN events e ON e.eventid = a.eventid \
             WHERE a.alerttype = $1 AND a.status = ANY($2) AND a.nextsend <= $3 \
             ORDER BY a.nextsend ASC, a.alertid ASC",
        )
        .bind(ALERT_TYPE_MESSAGE)
        .bind(&statuses)
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
                retries: row.get::<i32, _>("retries") as u32,
                nextsend: now,
            });
        }

        if !newly_read.is_empty() {
            sqlx::query("UPDATE alerts SET status = $1 WHERE alertid = ANY($2)")
                .bind(AlertStatus::NotSent.code())
                .bind(&newly_read)
                .execute(&self.pool)
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

        let rows = sqlx::query(
            "SELECT mediatypeid, type, maxsessions, maxattempts, attempt_interval, \
                    smtp_server, smtp_port, smtp_helo, smtp_email, smtp_security, \
                    smtp_verify_peer, smtp_verify_host, smtp_authentication, \
                    username, passwd, gsm_modem, endpoint_path, exec_path, exec_params \
             FROM media_type WHERE mediatypeid = ANY($1)",
        )
        .bind(mediatype_ids)
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
                maxsessions: row.get::<i32, _>("maxsessions") as u32,
                maxattempts: row.get::<i32, _>("maxattempts") as u32,
                attempt_interval_secs: row.get::<i32, _>("attempt_interval") as u32,
                smtp_server: row.get("smtp_server"),
                smtp_port,
                smtp_helo: row.get("smtp_helo"),
                smtp_email: row.get("smtp_email"),
                smtp_security: row.get("smtp_security"),
                smtp_verify_peer: row.get("smtp_verify_peer"),
                smtp_verify_host: row.get("smtp_verify_host"),
                smtp_authentication: row.get("smtp_authentication"),
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
            sqlx::query("UPDATE alerts SET status = $1, retries = $2, error = $3 WHERE alertid = $4")
                .bind(update.status.code())
                .bind(update.retries as i32)
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
                eventid BIGINT PRIMARY KEY,
                source INTEGER NOT NULL,
                object INTEGER NOT NULL,
                objectid BIGINT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AlertManagerError::Other(e.into()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                alertid BIGINT PRIMARY KEY,
                eventid BIGINT NOT NULL,
                mediatypeid BIGINT NOT NULL,
                alerttype INTEGER NOT NULL DEFAULT 0,
                sendto TEXT NOT NULL,
                subject TEXT NOT NULL,
                message TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                retries INTEGER NOT NULL DEFAULT 0,
                error TEXT NOT NULL DEFAULT '',
                nextsend BIGINT NOT NULL DEFAULT 0
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
                mediatypeid BIGINT PRIMARY KEY,
                type INTEGER NOT NULL,
                maxsessions INTEGER NOT NULL DEFAULT 1,
                maxattempts INTEGER NOT NULL DEFAULT 3,
                attempt_interval INTEGER NOT NULL DEFAULT 10,
                smtp_server TEXT NOT NULL DEFAULT '',
                smtp_port TEXT NOT NULL DEFAULT '25',
                smtp_helo TEXT NOT NULL DEFAULT '',
                smtp_email TEXT NOT NULL DEFAULT '',
                smtp_security TEXT NOT NULL DEFAULT '',
                smtp_verify_peer BOOLEAN NOT NULL DEFAULT false,
                smtp_verify_host BOOLEAN NOT NULL DEFAULT false,
                smtp_authentication BOOLEAN NOT NULL DEFAULT false,
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

        info!("initialized postgres alert-manager schema");
        Ok(())
    }
}
