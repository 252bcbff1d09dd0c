use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use courier_core::{
    BounceType, CampaignStats, DeliveryStatus, EngagementKind, Message, MessageRecipient,
    Recipient, RecipientStatus, RecipientSummary, RecipientType, classify_bounce, normalize_email,
};
use courier_store::{RecipientTracker, StoreError, envelope_slots, workspace_scope};

use crate::migrations;

fn backend_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// SQL rendering of [`workspace_scope`]: explicit workspace id, else the
/// lowercased sender domain, else the catch-all.
const SCOPE_SQL: &str =
    "COALESCE(m.workspace_id, NULLIF(LOWER(SPLIT_PART(m.from_address, '@', 2)), ''), 'default')";

fn recipient_from_row(row: &PgRow) -> Result<Recipient, StoreError> {
    let status_raw: String = row.try_get("status").map_err(backend_err)?;
    let status = RecipientStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Serialization(format!("unknown recipient status {status_raw}")))?;
    let bounce_type: Option<String> = row.try_get("bounce_type").map_err(backend_err)?;
    let bounce_count: i32 = row.try_get("bounce_count").map_err(backend_err)?;

    Ok(Recipient {
        id: row.try_get("id").map_err(backend_err)?,
        workspace_id: row.try_get("workspace_id").map_err(backend_err)?,
        email_address: row.try_get("email_address").map_err(backend_err)?,
        user_id: row.try_get("user_id").map_err(backend_err)?,
        campaign_id: row.try_get("campaign_id").map_err(backend_err)?,
        first_name: row.try_get("first_name").map_err(backend_err)?,
        last_name: row.try_get("last_name").map_err(backend_err)?,
        status,
        opt_in_date: row.try_get("opt_in_date").map_err(backend_err)?,
        opt_out_date: row.try_get("opt_out_date").map_err(backend_err)?,
        bounce_count: bounce_count.unsigned_abs(),
        last_bounce_date: row.try_get("last_bounce_date").map_err(backend_err)?,
        bounce_type: bounce_type.as_deref().and_then(BounceType::parse),
        metadata: row.try_get("metadata").map_err(backend_err)?,
        created_at: row.try_get("created_at").map_err(backend_err)?,
        updated_at: row.try_get("updated_at").map_err(backend_err)?,
    })
}

fn message_recipient_from_row(row: &PgRow) -> Result<MessageRecipient, StoreError> {
    let type_raw: String = row.try_get("recipient_type").map_err(backend_err)?;
    let recipient_type = RecipientType::parse(&type_raw)
        .ok_or_else(|| StoreError::Serialization(format!("unknown recipient type {type_raw}")))?;
    let status_raw: String = row.try_get("delivery_status").map_err(backend_err)?;
    let delivery_status = DeliveryStatus::parse(&status_raw).ok_or_else(|| {
        StoreError::Serialization(format!("unknown delivery status {status_raw}"))
    })?;
    let attempts: i32 = row.try_get("send_attempt_count").map_err(backend_err)?;
    let opens: i32 = row.try_get("opens").map_err(backend_err)?;
    let clicks: i32 = row.try_get("clicks").map_err(backend_err)?;

    Ok(MessageRecipient {
        id: row.try_get("id").map_err(backend_err)?,
        message_id: row.try_get("message_id").map_err(backend_err)?,
        recipient_id: row.try_get("recipient_id").map_err(backend_err)?,
        recipient_type,
        delivery_status,
        sent_at: row.try_get("sent_at").map_err(backend_err)?,
        bounce_reason: row.try_get("bounce_reason").map_err(backend_err)?,
        gateway_id: row.try_get("gateway_id").map_err(backend_err)?,
        gateway_kind: row.try_get("gateway_kind").map_err(backend_err)?,
        send_attempt_count: attempts.unsigned_abs(),
        last_send_attempt: row.try_get("last_send_attempt").map_err(backend_err)?,
        opens: opens.unsigned_abs(),
        clicks: clicks.unsigned_abs(),
        last_open_at: row.try_get("last_open_at").map_err(backend_err)?,
        last_click_at: row.try_get("last_click_at").map_err(backend_err)?,
        created_at: row.try_get("created_at").map_err(backend_err)?,
    })
}

/// Postgres-backed [`RecipientTracker`].
///
/// Webhook and dispatcher writes to the same junction row serialize on
/// row-level locks; engagement counters use monotonic `SET x = x + 1`
/// updates so concurrent writers never lose increments.
pub struct PgRecipientTracker {
    pool: PgPool,
}

impl PgRecipientTracker {
    /// Build from an existing pool (shared with the queue). Runs
    /// migrations.
    pub async fn from_pool(pool: PgPool) -> Result<Self, StoreError> {
        migrations::run_migrations(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl RecipientTracker for PgRecipientTracker {
    async fn process_message_recipients(
        &self,
        message: &Message,
    ) -> Result<Vec<MessageRecipient>, StoreError> {
        let workspace = workspace_scope(message);
        let slots = envelope_slots(message);
        if slots.is_empty() {
            return Err(StoreError::Backend(format!(
                "message {} has no recipients",
                message.id
            )));
        }

        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        let mut rows = Vec::with_capacity(slots.len());

        for (email, kind) in slots {
            let recipient_id: Uuid = sqlx::query_scalar(
                "INSERT INTO recipients (
                    id, workspace_id, email_address, user_id, campaign_id,
                    status, opt_in_date
                 ) VALUES ($1, $2, $3, $4, $5, 'active', NOW())
                 ON CONFLICT (workspace_id, email_address)
                 DO UPDATE SET updated_at = NOW()
                 RETURNING id",
            )
            .bind(Uuid::new_v4())
            .bind(&workspace)
            .bind(&email)
            .bind(&message.user_id)
            .bind(&message.campaign_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(backend_err)?;

            // Re-expansion on a retry attempt reuses the existing row.
            let row = sqlx::query(
                "INSERT INTO message_recipients (
                    id, message_id, recipient_id, recipient_type, delivery_status
                 ) VALUES ($1, $2, $3, $4, 'pending')
                 ON CONFLICT (message_id, recipient_id, recipient_type)
                 DO UPDATE SET recipient_type = EXCLUDED.recipient_type
                 RETURNING *",
            )
            .bind(Uuid::new_v4())
            .bind(message.id)
            .bind(recipient_id)
            .bind(kind.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(backend_err)?;

            rows.push(message_recipient_from_row(&row)?);
        }

        tx.commit().await.map_err(backend_err)?;
        Ok(rows)
    }

    async fn deliverable_recipients(&self, message: &Message) -> Result<Vec<String>, StoreError> {
        let workspace = workspace_scope(message);
        let mut emails: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (email, _) in envelope_slots(message) {
            if seen.insert(email.clone()) {
                emails.push(email);
            }
        }

        let rows = sqlx::query(
            "SELECT email_address, status FROM recipients
              WHERE workspace_id = $1 AND email_address = ANY($2)",
        )
        .bind(&workspace)
        .bind(&emails)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        let mut suppressed = std::collections::HashSet::new();
        for row in rows {
            let email: String = row.try_get("email_address").map_err(backend_err)?;
            let status_raw: String = row.try_get("status").map_err(backend_err)?;
            if RecipientStatus::parse(&status_raw).is_some_and(|s| !s.is_deliverable()) {
                suppressed.insert(email);
            }
        }

        Ok(emails
            .into_iter()
            .filter(|e| !suppressed.contains(e))
            .collect())
    }

    async fn update_delivery_status(
        &self,
        message_id: Uuid,
        email: &str,
        status: DeliveryStatus,
        bounce_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let email = normalize_email(email);
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        let row = sqlx::query(
            "SELECT mr.id, mr.delivery_status, mr.recipient_id
               FROM message_recipients mr
               JOIN recipients r ON r.id = mr.recipient_id
              WHERE mr.message_id = $1 AND r.email_address = $2
              FOR UPDATE OF mr",
        )
        .bind(message_id)
        .bind(&email)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend_err)?
        .ok_or_else(|| {
            StoreError::NotFound(format!("message recipient ({message_id}, {email})"))
        })?;

        let junction_id: Uuid = row.try_get("id").map_err(backend_err)?;
        let recipient_id: Uuid = row.try_get("recipient_id").map_err(backend_err)?;
        let current_raw: String = row.try_get("delivery_status").map_err(backend_err)?;
        let current = DeliveryStatus::parse(&current_raw).ok_or_else(|| {
            StoreError::Serialization(format!("unknown delivery status {current_raw}"))
        })?;

        if !current.allows_transition_to(status) {
            tx.commit().await.map_err(backend_err)?;
            return Ok(());
        }

        sqlx::query(
            "UPDATE message_recipients
                SET delivery_status = $2,
                    sent_at = CASE WHEN $2 = 'sent' THEN NOW() ELSE sent_at END,
                    bounce_reason = CASE WHEN $2 = 'bounced' THEN $3 ELSE bounce_reason END
              WHERE id = $1",
        )
        .bind(junction_id)
        .bind(status.as_str())
        .bind(bounce_reason)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;

        if status == DeliveryStatus::Bounced {
            let bounce_type = classify_bounce(bounce_reason.unwrap_or_default());
            sqlx::query(
                "UPDATE recipients
                    SET bounce_count = bounce_count + 1,
                        last_bounce_date = NOW(),
                        bounce_type = $2,
                        status = CASE
                            WHEN $2 = 'hard' OR bounce_count + 1 >= 5 THEN 'bounced'
                            ELSE status
                        END,
                        updated_at = NOW()
                  WHERE id = $1",
            )
            .bind(recipient_id)
            .bind(bounce_type.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        }

        tx.commit().await.map_err(backend_err)
    }

    async fn record_dispatch_outcome(
        &self,
        message_id: Uuid,
        recipients: &[String],
        status: DeliveryStatus,
        gateway_id: Option<&str>,
        gateway_kind: Option<&str>,
        bounce_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        // Only the recipients the attempt covered; suppressed junction
        // rows stay pending.
        let emails: Vec<String> = recipients.iter().map(|e| normalize_email(e)).collect();
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        sqlx::query(
            "UPDATE message_recipients
                SET send_attempt_count = send_attempt_count + 1,
                    last_send_attempt = NOW(),
                    gateway_id = COALESCE($3, gateway_id),
                    gateway_kind = COALESCE($4, gateway_kind),
                    sent_at = CASE
                        WHEN $2 = 'sent' AND delivery_status <> 'bounced' THEN NOW()
                        ELSE sent_at
                    END,
                    bounce_reason = CASE WHEN $2 = 'bounced' THEN $5 ELSE bounce_reason END,
                    delivery_status = CASE
                        WHEN delivery_status = 'sent' AND $2 = 'pending' THEN delivery_status
                        WHEN delivery_status = 'bounced' AND $2 = 'sent' THEN delivery_status
                        ELSE $2
                    END
               FROM recipients r
              WHERE message_recipients.message_id = $1
                AND r.id = message_recipients.recipient_id
                AND r.email_address = ANY($6)",
        )
        .bind(message_id)
        .bind(status.as_str())
        .bind(gateway_id)
        .bind(gateway_kind)
        .bind(bounce_reason)
        .bind(&emails)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;

        if status == DeliveryStatus::Bounced {
            let bounce_type = classify_bounce(bounce_reason.unwrap_or_default());
            sqlx::query(
                "UPDATE recipients r
                    SET bounce_count = r.bounce_count + 1,
                        last_bounce_date = NOW(),
                        bounce_type = $2,
                        status = CASE
                            WHEN $2 = 'hard' OR r.bounce_count + 1 >= 5 THEN 'bounced'
                            ELSE r.status
                        END,
                        updated_at = NOW()
                   FROM message_recipients mr
                  WHERE mr.recipient_id = r.id
                    AND mr.message_id = $1
                    AND r.email_address = ANY($3)",
            )
            .bind(message_id)
            .bind(bounce_type.as_str())
            .bind(&emails)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        }

        tx.commit().await.map_err(backend_err)
    }

    async fn record_engagement(
        &self,
        message_id: Uuid,
        email: &str,
        kind: EngagementKind,
        data: serde_json::Value,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<(), StoreError> {
        let email = normalize_email(email);
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        let row = sqlx::query(
            "SELECT mr.id, mr.recipient_id
               FROM message_recipients mr
               JOIN recipients r ON r.id = mr.recipient_id
              WHERE mr.message_id = $1 AND r.email_address = $2
              FOR UPDATE OF mr",
        )
        .bind(message_id)
        .bind(&email)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend_err)?
        .ok_or_else(|| {
            StoreError::NotFound(format!("message recipient ({message_id}, {email})"))
        })?;

        let junction_id: Uuid = row.try_get("id").map_err(backend_err)?;
        let recipient_id: Uuid = row.try_get("recipient_id").map_err(backend_err)?;

        match kind {
            EngagementKind::Open => {
                sqlx::query(
                    "UPDATE message_recipients
                        SET opens = opens + 1, last_open_at = NOW()
                      WHERE id = $1",
                )
                .bind(junction_id)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
            }
            EngagementKind::Click => {
                sqlx::query(
                    "UPDATE message_recipients
                        SET clicks = clicks + 1, last_click_at = NOW()
                      WHERE id = $1",
                )
                .bind(junction_id)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
            }
            EngagementKind::Unsubscribe => {
                sqlx::query(
                    "UPDATE recipients
                        SET status = 'unsubscribed', opt_out_date = NOW(), updated_at = NOW()
                      WHERE id = $1",
                )
                .bind(recipient_id)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
            }
            // Bounce state is driven through update_delivery_status; the
            // event is only logged here.
            EngagementKind::Complaint | EngagementKind::Bounce => {}
        }

        sqlx::query(
            "INSERT INTO recipient_events (
                id, message_recipient_id, event_type, event_data, ip_address, user_agent
             ) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(junction_id)
        .bind(kind.as_str())
        .bind(data)
        .bind(ip)
        .bind(user_agent)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;

        tx.commit().await.map_err(backend_err)
    }

    async fn recipient_summary(
        &self,
        email: &str,
        workspace_id: &str,
    ) -> Result<Option<RecipientSummary>, StoreError> {
        let email = normalize_email(email);
        let Some(recipient) = self.get_recipient(workspace_id, &email).await? else {
            return Ok(None);
        };

        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE delivery_status = 'sent') AS sent,
                    COUNT(*) FILTER (WHERE delivery_status = 'bounced') AS bounced,
                    COALESCE(SUM(opens), 0) AS opens,
                    COALESCE(SUM(clicks), 0) AS clicks
               FROM message_recipients
              WHERE recipient_id = $1",
        )
        .bind(recipient.id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend_err)?;

        let total: i64 = row.try_get("total").map_err(backend_err)?;
        let sent: i64 = row.try_get("sent").map_err(backend_err)?;
        let bounced: i64 = row.try_get("bounced").map_err(backend_err)?;
        let opens: i64 = row.try_get("opens").map_err(backend_err)?;
        let clicks: i64 = row.try_get("clicks").map_err(backend_err)?;

        #[allow(clippy::cast_precision_loss)]
        let engagement_rate = if total == 0 {
            0.0
        } else {
            (opens + clicks) as f64 / total as f64
        };

        Ok(Some(RecipientSummary {
            email_address: email,
            workspace_id: workspace_id.to_owned(),
            status: recipient.status,
            total_messages: total.unsigned_abs(),
            total_sent: sent.unsigned_abs(),
            total_bounced: bounced.unsigned_abs(),
            total_opens: opens.unsigned_abs(),
            total_clicks: clicks.unsigned_abs(),
            bounce_count: recipient.bounce_count,
            engagement_rate,
        }))
    }

    async fn campaign_stats(
        &self,
        campaign_id: &str,
        workspace_id: &str,
    ) -> Result<CampaignStats, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE mr.delivery_status = 'sent') AS sent,
                    COUNT(*) FILTER (WHERE mr.delivery_status = 'bounced') AS bounced,
                    COALESCE(SUM(mr.opens), 0) AS opens,
                    COALESCE(SUM(mr.clicks), 0) AS clicks,
                    COUNT(*) FILTER (WHERE mr.opens > 0) AS opened,
                    COUNT(*) FILTER (WHERE mr.clicks > 0) AS clicked
               FROM message_recipients mr
               JOIN messages m ON m.id = mr.message_id
              WHERE m.campaign_id = $1 AND {SCOPE_SQL} = $2"
        );
        let row = sqlx::query(&sql)
            .bind(campaign_id)
            .bind(workspace_id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;

        let total: i64 = row.try_get("total").map_err(backend_err)?;
        let sent: i64 = row.try_get("sent").map_err(backend_err)?;
        let bounced: i64 = row.try_get("bounced").map_err(backend_err)?;
        let opens: i64 = row.try_get("opens").map_err(backend_err)?;
        let clicks: i64 = row.try_get("clicks").map_err(backend_err)?;
        let opened: i64 = row.try_get("opened").map_err(backend_err)?;
        let clicked: i64 = row.try_get("clicked").map_err(backend_err)?;

        #[allow(clippy::cast_precision_loss)]
        let rate = |num: i64, den: i64| if den == 0 { 0.0 } else { num as f64 / den as f64 };

        Ok(CampaignStats {
            campaign_id: campaign_id.to_owned(),
            workspace_id: workspace_id.to_owned(),
            total_recipients: total.unsigned_abs(),
            total_sent: sent.unsigned_abs(),
            total_bounced: bounced.unsigned_abs(),
            total_opens: opens.unsigned_abs(),
            total_clicks: clicks.unsigned_abs(),
            open_rate: rate(opened, sent),
            click_rate: rate(clicked, sent),
            bounce_rate: rate(bounced, total),
        })
    }

    async fn get_recipient(
        &self,
        workspace_id: &str,
        email: &str,
    ) -> Result<Option<Recipient>, StoreError> {
        let email = normalize_email(email);
        let row = sqlx::query(
            "SELECT * FROM recipients WHERE workspace_id = $1 AND email_address = $2",
        )
        .bind(workspace_id)
        .bind(&email)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        row.as_ref().map(recipient_from_row).transpose()
    }

    async fn get_message_recipient(
        &self,
        message_id: Uuid,
        email: &str,
    ) -> Result<Option<MessageRecipient>, StoreError> {
        let email = normalize_email(email);
        let row = sqlx::query(
            "SELECT mr.* FROM message_recipients mr
               JOIN recipients r ON r.id = mr.recipient_id
              WHERE mr.message_id = $1 AND r.email_address = $2",
        )
        .bind(message_id)
        .bind(&email)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        row.as_ref().map(message_recipient_from_row).transpose()
    }
}
