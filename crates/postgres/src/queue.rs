use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use courier_core::{HourlyBucket, Message, MessageStatus, normalize_email};
use courier_store::{MessageQueue, SentCounts, StoreError};

use crate::config::PostgresConfig;
use crate::migrations;

fn backend_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn json_column<T: serde::de::DeserializeOwned>(row: &PgRow, name: &str) -> Result<T, StoreError> {
    let value: serde_json::Value = row.try_get(name).map_err(backend_err)?;
    serde_json::from_value(value)
        .map_err(|e| StoreError::Serialization(format!("column {name}: {e}")))
}

pub(crate) fn message_from_row(row: &PgRow) -> Result<Message, StoreError> {
    let status_raw: String = row.try_get("status").map_err(backend_err)?;
    let status = MessageStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Serialization(format!("unknown message status {status_raw}")))?;
    let retry_count: i32 = row.try_get("retry_count").map_err(backend_err)?;

    Ok(Message {
        id: row.try_get("id").map_err(backend_err)?,
        from: row.try_get("from_address").map_err(backend_err)?,
        to: json_column(row, "to_addresses")?,
        cc: json_column(row, "cc_addresses")?,
        bcc: json_column(row, "bcc_addresses")?,
        subject: row.try_get("subject").map_err(backend_err)?,
        html: row.try_get("html").map_err(backend_err)?,
        text: row.try_get("text_body").map_err(backend_err)?,
        headers: json_column(row, "headers")?,
        attachments: json_column(row, "attachments")?,
        workspace_id: row.try_get("workspace_id").map_err(backend_err)?,
        campaign_id: row.try_get("campaign_id").map_err(backend_err)?,
        user_id: row.try_get("user_id").map_err(backend_err)?,
        invitation_id: row.try_get("invitation_id").map_err(backend_err)?,
        retry_count: retry_count.unsigned_abs(),
        queued_at: row.try_get("queued_at").map_err(backend_err)?,
        processed_at: row.try_get("processed_at").map_err(backend_err)?,
        sent_at: row.try_get("sent_at").map_err(backend_err)?,
        status,
        error: row.try_get("error").map_err(backend_err)?,
        provider_id: row.try_get("provider_id").map_err(backend_err)?,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Postgres-backed [`MessageQueue`].
///
/// Claims rely on `FOR UPDATE SKIP LOCKED` inside a transaction, so
/// concurrent dispatchers (including other processes) never see the same
/// row.
pub struct PgMessageQueue {
    pool: PgPool,
}

impl PgMessageQueue {
    /// Connect, size the pool per configuration, and run migrations.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .max_lifetime(config.max_lifetime())
            .connect(&config.url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Self::from_pool(pool).await
    }

    /// Build from an existing pool (shared with the tracker). Runs
    /// migrations.
    pub async fn from_pool(pool: PgPool) -> Result<Self, StoreError> {
        migrations::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// A handle to the underlying pool, for sharing with sibling stores.
    #[must_use]
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }
}

#[async_trait]
impl MessageQueue for PgMessageQueue {
    async fn enqueue(&self, message: Message) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO messages (
                id, from_address, to_addresses, cc_addresses, bcc_addresses,
                subject, html, text_body, headers, attachments,
                workspace_id, campaign_id, user_id, invitation_id,
                retry_count, queued_at, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                      $11, $12, $13, $14, $15, $16, $17)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(message.id)
        .bind(&message.from)
        .bind(to_json(&message.to)?)
        .bind(to_json(&message.cc)?)
        .bind(to_json(&message.bcc)?)
        .bind(&message.subject)
        .bind(&message.html)
        .bind(&message.text)
        .bind(to_json(&message.headers)?)
        .bind(to_json(&message.attachments)?)
        .bind(&message.workspace_id)
        .bind(&message.campaign_id)
        .bind(&message.user_id)
        .bind(&message.invitation_id)
        .bind(i32::try_from(message.retry_count).unwrap_or(i32::MAX))
        .bind(message.queued_at)
        .bind(MessageStatus::Queued.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(format!("message {}", message.id)));
        }
        Ok(())
    }

    async fn dequeue(&self, batch_size: usize) -> Result<Vec<Message>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        let rows = sqlx::query(
            "WITH claimed AS (
                SELECT id FROM messages
                WHERE status = 'queued'
                   OR (status IN ('failed', 'auth_error') AND retry_count < 3)
                ORDER BY queued_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE messages m
               SET status = 'processing'
              FROM claimed
             WHERE m.id = claimed.id
            RETURNING m.*",
        )
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(backend_err)?;

        tx.commit().await.map_err(backend_err)?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the claim order.
        messages.sort_by_key(|m| m.queued_at);
        Ok(messages)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE messages
                SET status = $2,
                    retry_count = retry_count + 1,
                    processed_at = NOW(),
                    error = $3,
                    sent_at = CASE WHEN $2 = 'sent' THEN NOW() ELSE sent_at END
              WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("message {id}")));
        }
        Ok(())
    }

    async fn update_status_with_gateway(
        &self,
        id: Uuid,
        status: MessageStatus,
        gateway_id: &str,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE messages
                SET status = $2,
                    retry_count = retry_count + 1,
                    processed_at = NOW(),
                    error = $3,
                    provider_id = $4,
                    sent_at = CASE WHEN $2 = 'sent' THEN NOW() ELSE sent_at END
              WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .bind(gateway_id)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("message {id}")));
        }
        Ok(())
    }

    async fn mark_queued(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE messages SET status = 'queued' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("message {id}")));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn remove(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn sent_counts_by_gateway_and_sender(&self) -> Result<SentCounts, StoreError> {
        let rows = sqlx::query(
            "SELECT provider_id, LOWER(from_address) AS sender, COUNT(*) AS sends
               FROM messages
              WHERE status = 'sent'
                AND provider_id IS NOT NULL
                AND sent_at >= NOW() - INTERVAL '24 hours'
              GROUP BY provider_id, LOWER(from_address)",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        let mut counts: SentCounts = HashMap::new();
        for row in rows {
            let gateway: String = row.try_get("provider_id").map_err(backend_err)?;
            let sender: String = row.try_get("sender").map_err(backend_err)?;
            let sends: i64 = row.try_get("sends").map_err(backend_err)?;
            counts
                .entry(gateway)
                .or_default()
                .insert(normalize_email(&sender), sends.unsigned_abs());
        }
        Ok(counts)
    }

    async fn status_counts(&self) -> Result<HashMap<MessageStatus, u64>, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM messages GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        let mut counts = HashMap::new();
        for row in rows {
            let status_raw: String = row.try_get("status").map_err(backend_err)?;
            let total: i64 = row.try_get("total").map_err(backend_err)?;
            if let Some(status) = MessageStatus::parse(&status_raw) {
                counts.insert(status, total.unsigned_abs());
            }
        }
        Ok(counts)
    }

    async fn counts_today(&self) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM messages
              WHERE queued_at >= DATE_TRUNC('day', NOW() AT TIME ZONE 'UTC') AT TIME ZONE 'UTC'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(backend_err)?;
        let total: i64 = row.try_get("total").map_err(backend_err)?;
        Ok(total.unsigned_abs())
    }

    async fn hourly_sent_counts(&self, hours: u32) -> Result<Vec<HourlyBucket>, StoreError> {
        let rows = sqlx::query(
            "SELECT DATE_TRUNC('hour', COALESCE(sent_at, processed_at)) AS hour,
                    COUNT(*) FILTER (WHERE status = 'sent') AS sent,
                    COUNT(*) FILTER (WHERE status IN ('failed', 'auth_error')) AS failed
               FROM messages
              WHERE COALESCE(sent_at, processed_at) >= NOW() - MAKE_INTERVAL(hours => $1)
              GROUP BY 1
              ORDER BY 1",
        )
        .bind(i32::try_from(hours).unwrap_or(i32::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        let mut buckets = Vec::with_capacity(rows.len());
        for row in rows {
            let hour: DateTime<Utc> = row.try_get("hour").map_err(backend_err)?;
            let sent: i64 = row.try_get("sent").map_err(backend_err)?;
            let failed: i64 = row.try_get("failed").map_err(backend_err)?;
            buckets.push(HourlyBucket {
                hour,
                sent: sent.unsigned_abs(),
                failed: failed.unsigned_abs(),
            });
        }
        Ok(buckets)
    }
}
