//! Store primitives on Postgres via direct SQLx.
//!
//! Lists are rows in `tasq_queue` ordered by id. A key's expiry lives in
//! `tasq_queue_ttl`; expired keys are purged whenever they are touched.
//! PUBLISH is `pg_notify` carrying a [`Notification`]: hex inline when the
//! message fits, otherwise the id of a `tasq_message` row written in the same
//! transaction. SUBSCRIBE is a dedicated `PgListener` connection per
//! subscription that resolves stored rows through the pool.

use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use sqlx::postgres::PgListener;
use sqlx::{PgConnection, PgPool};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::Db;
use super::notify::{MAX_CHANNEL_LEN, Notification};
use crate::error::{Error, Result};
use crate::store::{Command, Store, Subscription, Transaction};
use crate::telemetry::metrics;

/// Back-off before retrying a failed LISTEN connection.
const LISTEN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How long an out-of-band message stays readable by late listeners.
const MESSAGE_RETENTION: Duration = Duration::from_secs(300);

const PURGE_EXPIRED: &str = "
    WITH expired AS (
        DELETE FROM tasq_queue_ttl
        WHERE queue_key = $1 AND expires_at <= now()
        RETURNING queue_key
    )
    DELETE FROM tasq_queue WHERE queue_key IN (SELECT queue_key FROM expired)";

const RPUSH: &str = "INSERT INTO tasq_queue (queue_key, payload) VALUES ($1, $2)";

const PEXPIRE: &str = "
    INSERT INTO tasq_queue_ttl (queue_key, expires_at)
    SELECT $1, now() + ($2::float8 * interval '1 millisecond')
    WHERE EXISTS (SELECT 1 FROM tasq_queue WHERE queue_key = $1)
    ON CONFLICT (queue_key) DO UPDATE SET expires_at = EXCLUDED.expires_at";

const LPOP: &str = "
    DELETE FROM tasq_queue
    WHERE id = (
        SELECT id FROM tasq_queue
        WHERE queue_key = $1
        ORDER BY id
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    )
    RETURNING payload";

// An emptied list loses its expiry, like a deleted key.
const FORGET_EMPTY: &str = "
    DELETE FROM tasq_queue_ttl
    WHERE queue_key = $1
      AND NOT EXISTS (SELECT 1 FROM tasq_queue WHERE queue_key = $1)";

const PUBLISH: &str = "SELECT pg_notify($1, $2)";

const STORE_MESSAGE: &str =
    "INSERT INTO tasq_message (channel, payload) VALUES ($1, $2) RETURNING id";

const PURGE_MESSAGES: &str = "
    DELETE FROM tasq_message
    WHERE created_at < now() - ($1::float8 * interval '1 millisecond')";

const LOAD_MESSAGE: &str = "SELECT payload FROM tasq_message WHERE id = $1";

fn record(operation: &'static str) {
    metrics::store_operations().add(
        1,
        &[
            KeyValue::new("backend", "postgres"),
            KeyValue::new("operation", operation),
        ],
    );
}

async fn purge_expired(conn: &mut PgConnection, key: &str) -> Result<()> {
    sqlx::query(PURGE_EXPIRED).bind(key).execute(conn).await?;
    Ok(())
}

fn check_channel(channel: &str) -> Result<()> {
    if channel.len() > MAX_CHANNEL_LEN {
        return Err(Error::InvalidArgument(format!(
            "channel {channel:?} is {} bytes, Postgres allows {MAX_CHANNEL_LEN}",
            channel.len()
        )));
    }
    Ok(())
}

/// Queue a NOTIFY for `payload` on `conn`. Delivery happens on commit.
async fn notify(conn: &mut PgConnection, channel: &str, payload: &[u8]) -> Result<()> {
    check_channel(channel)?;
    let notification = if Notification::fits_inline(payload) {
        Notification::Inline(payload.to_vec())
    } else {
        let retention_ms = i64::try_from(MESSAGE_RETENTION.as_millis()).unwrap_or(i64::MAX);
        sqlx::query(PURGE_MESSAGES)
            .bind(retention_ms)
            .execute(&mut *conn)
            .await?;
        let (id,): (i64,) = sqlx::query_as(STORE_MESSAGE)
            .bind(channel)
            .bind(payload)
            .fetch_one(&mut *conn)
            .await?;
        Notification::Stored(id)
    };
    sqlx::query(PUBLISH)
        .bind(channel)
        .bind(notification.encode())
        .execute(conn)
        .await?;
    Ok(())
}

/// The message a notification stands for. `None` if its row was purged.
async fn resolve(pool: &PgPool, text: &str) -> Result<Option<Vec<u8>>> {
    match Notification::parse(text)? {
        Notification::Inline(payload) => Ok(Some(payload)),
        Notification::Stored(id) => {
            let row: Option<(Vec<u8>,)> = sqlx::query_as(LOAD_MESSAGE)
                .bind(id)
                .fetch_optional(pool)
                .await?;
            Ok(row.map(|(payload,)| payload))
        }
    }
}

#[async_trait]
impl Store for Db {
    async fn exec(&self, tx: Transaction) -> Result<()> {
        let mut db_tx = self.pool().begin().await?;
        for command in tx {
            match command {
                Command::RPush { key, payload } => {
                    purge_expired(&mut db_tx, &key).await?;
                    sqlx::query(RPUSH)
                        .bind(&key)
                        .bind(payload)
                        .execute(&mut *db_tx)
                        .await?;
                }
                Command::PExpire { key, ttl } => {
                    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
                    sqlx::query(PEXPIRE)
                        .bind(&key)
                        .bind(ttl_ms)
                        .execute(&mut *db_tx)
                        .await?;
                }
                Command::Publish { channel, payload } => {
                    notify(&mut db_tx, &channel, &payload).await?;
                }
            }
        }
        // Notifications queued inside the transaction are only delivered on commit.
        db_tx.commit().await?;
        record("exec");
        Ok(())
    }

    async fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut db_tx = self.pool().begin().await?;
        purge_expired(&mut db_tx, key).await?;
        let row: Option<(Vec<u8>,)> = sqlx::query_as(LPOP)
            .bind(key)
            .fetch_optional(&mut *db_tx)
            .await?;
        if row.is_some() {
            sqlx::query(FORGET_EMPTY)
                .bind(key)
                .execute(&mut *db_tx)
                .await?;
        }
        db_tx.commit().await?;
        record(if row.is_some() { "lpop" } else { "lpop_empty" });
        Ok(row.map(|(payload,)| payload))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut db_tx = self.pool().begin().await?;
        notify(&mut db_tx, channel, payload).await?;
        db_tx.commit().await?;
        record("publish");
        Ok(())
    }

    fn max_channel_len(&self) -> Option<usize> {
        Some(MAX_CHANNEL_LEN)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        // LISTEN would silently truncate a long name and never match pg_notify.
        check_channel(channel)?;
        let mut listener = PgListener::connect_with(self.pool()).await?;
        listener.listen(channel).await?;
        record("subscribe");

        let (tx, rx) = mpsc::unbounded_channel();
        let name = channel.to_string();
        let pool = self.pool().clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => match resolve(&pool, notification.payload()).await {
                        Ok(Some(payload)) => {
                            if tx.send(payload).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            warn!(channel = %name, "stored message already purged, dropping");
                        }
                        Err(e) => {
                            warn!(channel = %name, "dropping notification: {e}");
                        }
                    },
                    Err(e) => {
                        warn!(channel = %name, "listener error: {e}, retrying");
                        tokio::time::sleep(LISTEN_RETRY_DELAY).await;
                    }
                }
            }
            debug!(channel = %name, "listener stopped");
        });

        Ok(Subscription::new(channel, rx, move || task.abort()))
    }
}
