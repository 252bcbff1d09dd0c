use std::collections::HashMap;

use sqlx::{PgPool, Row};
use tracing::{debug, info};

use courier_core::{
    GatewayConfig, GatewayHealth, GatewayKind, LoadBalancingPool, PoolMember, PoolStrategy,
    RateLimitConfig,
};
use courier_store::StoreError;

use crate::migrations;

fn backend_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
    what: &str,
) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(format!("{what}: {e}")))
}

/// Loads and persists gateway, pool, and rate-limit configuration.
///
/// The dispatcher reads this at boot and on reload notifications; writes
/// exist for seeding and the (external) configuration surface.
pub struct ConfigRepository {
    pool: PgPool,
}

impl ConfigRepository {
    /// Build from an existing pool. Runs migrations.
    pub async fn from_pool(pool: PgPool) -> Result<Self, StoreError> {
        migrations::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Load every configured gateway with its rate limits.
    pub async fn load_gateways(&self) -> Result<Vec<GatewayConfig>, StoreError> {
        let rows = sqlx::query("SELECT * FROM workspaces ORDER BY priority, id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        let mut gateways = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id").map_err(backend_err)?;
            let kind_raw: String = row.try_get("kind").map_err(backend_err)?;
            let kind = GatewayKind::parse(&kind_raw).ok_or_else(|| {
                StoreError::Serialization(format!("unknown gateway kind {kind_raw}"))
            })?;
            let priority: i32 = row.try_get("priority").map_err(backend_err)?;
            let weight: i32 = row.try_get("weight").map_err(backend_err)?;

            let mut gateway = GatewayConfig {
                id: id.clone(),
                display_name: row.try_get("display_name").map_err(backend_err)?,
                kind,
                domain: row.try_get("domain").map_err(backend_err)?,
                priority: priority.unsigned_abs(),
                weight: weight.unsigned_abs(),
                enabled: row.try_get("enabled").map_err(backend_err)?,
                credentials: from_json(
                    row.try_get("credentials").map_err(backend_err)?,
                    "workspace credentials",
                )?,
                rate_limits: RateLimitConfig::default(),
                tracking: from_json(
                    row.try_get("tracking").map_err(backend_err)?,
                    "workspace tracking",
                )?,
                header_rewrites: from_json(
                    row.try_get("header_rewrites").map_err(backend_err)?,
                    "workspace header rewrites",
                )?,
                can_route: row.try_get("can_route").map_err(backend_err)?,
                exclude_patterns: from_json(
                    row.try_get("exclude_patterns").map_err(backend_err)?,
                    "workspace exclude patterns",
                )?,
                failover_to: from_json(
                    row.try_get("failover_to").map_err(backend_err)?,
                    "workspace failover list",
                )?,
            };
            gateway.rate_limits = self.load_rate_limits(&id).await?;
            self.record_credential_audit(&id, "credentials_loaded", None)
                .await?;
            gateways.push(gateway);
        }

        info!(count = gateways.len(), "loaded gateway configurations");
        Ok(gateways)
    }

    async fn load_rate_limits(&self, workspace_id: &str) -> Result<RateLimitConfig, StoreError> {
        let mut config = RateLimitConfig::default();

        let row = sqlx::query(
            "SELECT workspace_daily, per_user_daily, per_user_hourly, burst_limit
               FROM workspace_rate_limits WHERE workspace_id = $1",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        if let Some(row) = row {
            let daily: Option<i64> = row.try_get("workspace_daily").map_err(backend_err)?;
            let user_daily: Option<i64> = row.try_get("per_user_daily").map_err(backend_err)?;
            let user_hourly: Option<i64> = row.try_get("per_user_hourly").map_err(backend_err)?;
            let burst: Option<i64> = row.try_get("burst_limit").map_err(backend_err)?;
            config.workspace_daily = daily.map(i64::unsigned_abs);
            config.per_user_daily = user_daily.map(i64::unsigned_abs);
            config.per_user_hourly = user_hourly.map(i64::unsigned_abs);
            config.burst_limit = burst.map(i64::unsigned_abs);
        }

        let overrides = sqlx::query(
            "SELECT email, daily_limit FROM workspace_user_rate_limits WHERE workspace_id = $1",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        let mut custom = HashMap::new();
        for row in overrides {
            let email: String = row.try_get("email").map_err(backend_err)?;
            let limit: i64 = row.try_get("daily_limit").map_err(backend_err)?;
            custom.insert(email, limit.unsigned_abs());
        }
        config.custom_user_limits = custom;
        Ok(config)
    }

    /// Upsert a gateway and its rate limits.
    pub async fn save_gateway(&self, gateway: &GatewayConfig) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        sqlx::query(
            "INSERT INTO workspaces (
                id, display_name, kind, domain, priority, weight, enabled,
                credentials, tracking, header_rewrites, can_route,
                exclude_patterns, failover_to
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             ON CONFLICT (id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                kind = EXCLUDED.kind,
                domain = EXCLUDED.domain,
                priority = EXCLUDED.priority,
                weight = EXCLUDED.weight,
                enabled = EXCLUDED.enabled,
                credentials = EXCLUDED.credentials,
                tracking = EXCLUDED.tracking,
                header_rewrites = EXCLUDED.header_rewrites,
                can_route = EXCLUDED.can_route,
                exclude_patterns = EXCLUDED.exclude_patterns,
                failover_to = EXCLUDED.failover_to,
                updated_at = NOW()",
        )
        .bind(&gateway.id)
        .bind(&gateway.display_name)
        .bind(gateway.kind.as_str())
        .bind(&gateway.domain)
        .bind(i32::try_from(gateway.priority).unwrap_or(i32::MAX))
        .bind(i32::try_from(gateway.weight).unwrap_or(i32::MAX))
        .bind(gateway.enabled)
        .bind(to_json(&gateway.credentials)?)
        .bind(to_json(&gateway.tracking)?)
        .bind(to_json(&gateway.header_rewrites)?)
        .bind(gateway.can_route)
        .bind(to_json(&gateway.exclude_patterns)?)
        .bind(to_json(&gateway.failover_to)?)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;

        sqlx::query(
            "INSERT INTO workspace_rate_limits (
                workspace_id, workspace_daily, per_user_daily, per_user_hourly, burst_limit
             ) VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (workspace_id) DO UPDATE SET
                workspace_daily = EXCLUDED.workspace_daily,
                per_user_daily = EXCLUDED.per_user_daily,
                per_user_hourly = EXCLUDED.per_user_hourly,
                burst_limit = EXCLUDED.burst_limit",
        )
        .bind(&gateway.id)
        .bind(gateway.rate_limits.workspace_daily.map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
        .bind(gateway.rate_limits.per_user_daily.map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
        .bind(gateway.rate_limits.per_user_hourly.map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
        .bind(gateway.rate_limits.burst_limit.map(|v| i64::try_from(v).unwrap_or(i64::MAX)))
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;

        sqlx::query("DELETE FROM workspace_user_rate_limits WHERE workspace_id = $1")
            .bind(&gateway.id)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        for (email, limit) in &gateway.rate_limits.custom_user_limits {
            sqlx::query(
                "INSERT INTO workspace_user_rate_limits (workspace_id, email, daily_limit)
                 VALUES ($1, $2, $3)",
            )
            .bind(&gateway.id)
            .bind(email)
            .bind(i64::try_from(*limit).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        }

        tx.commit().await.map_err(backend_err)?;
        self.record_credential_audit(&gateway.id, "credentials_saved", None)
            .await
    }

    /// Load every pool with its patterns and ordered members.
    pub async fn load_pools(&self) -> Result<Vec<LoadBalancingPool>, StoreError> {
        let rows = sqlx::query("SELECT * FROM load_balancing_pools ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        let mut pools = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id").map_err(backend_err)?;
            let strategy_raw: String = row.try_get("strategy").map_err(backend_err)?;
            let strategy = PoolStrategy::parse(&strategy_raw).ok_or_else(|| {
                StoreError::Serialization(format!("unknown pool strategy {strategy_raw}"))
            })?;

            let patterns = sqlx::query(
                "SELECT pattern FROM pool_domain_patterns WHERE pool_id = $1 ORDER BY pattern",
            )
            .bind(&id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?
            .into_iter()
            .map(|r| r.try_get("pattern").map_err(backend_err))
            .collect::<Result<Vec<String>, _>>()?;

            let member_rows = sqlx::query(
                "SELECT gateway_id, weight, priority, enabled
                   FROM pool_members WHERE pool_id = $1 ORDER BY position, gateway_id",
            )
            .bind(&id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

            let mut members = Vec::with_capacity(member_rows.len());
            for member in member_rows {
                let weight: i32 = member.try_get("weight").map_err(backend_err)?;
                let priority: i32 = member.try_get("priority").map_err(backend_err)?;
                members.push(PoolMember {
                    gateway_id: member.try_get("gateway_id").map_err(backend_err)?,
                    weight: weight.unsigned_abs(),
                    priority: priority.unsigned_abs(),
                    enabled: member.try_get("enabled").map_err(backend_err)?,
                });
            }

            pools.push(LoadBalancingPool {
                id,
                name: row.try_get("name").map_err(backend_err)?,
                strategy,
                enabled: row.try_get("enabled").map_err(backend_err)?,
                is_default: row.try_get("is_default").map_err(backend_err)?,
                domain_patterns: patterns,
                members,
            });
        }

        debug!(count = pools.len(), "loaded load-balancing pools");
        Ok(pools)
    }

    /// Upsert a pool with its patterns and members.
    pub async fn save_pool(&self, pool: &LoadBalancingPool) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        sqlx::query(
            "INSERT INTO load_balancing_pools (id, name, strategy, enabled, is_default)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                strategy = EXCLUDED.strategy,
                enabled = EXCLUDED.enabled,
                is_default = EXCLUDED.is_default",
        )
        .bind(&pool.id)
        .bind(&pool.name)
        .bind(pool.strategy.as_str())
        .bind(pool.enabled)
        .bind(pool.is_default)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;

        sqlx::query("DELETE FROM pool_domain_patterns WHERE pool_id = $1")
            .bind(&pool.id)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        for pattern in &pool.domain_patterns {
            sqlx::query(
                "INSERT INTO pool_domain_patterns (pool_id, pattern) VALUES ($1, $2)",
            )
            .bind(&pool.id)
            .bind(pattern)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        }

        sqlx::query("DELETE FROM pool_members WHERE pool_id = $1")
            .bind(&pool.id)
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        for (position, member) in pool.members.iter().enumerate() {
            sqlx::query(
                "INSERT INTO pool_members (pool_id, gateway_id, weight, priority, enabled, position)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&pool.id)
            .bind(&member.gateway_id)
            .bind(i32::try_from(member.weight).unwrap_or(i32::MAX))
            .bind(i32::try_from(member.priority).unwrap_or(i32::MAX))
            .bind(member.enabled)
            .bind(i32::try_from(position).unwrap_or(i32::MAX))
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;
        }

        tx.commit().await.map_err(backend_err)
    }

    /// Record the latest health observation for a gateway.
    pub async fn record_provider_health(&self, health: &GatewayHealth) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO provider_health (gateway_id, healthy, error, checked_at, consecutive_failures)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (gateway_id) DO UPDATE SET
                healthy = EXCLUDED.healthy,
                error = EXCLUDED.error,
                checked_at = EXCLUDED.checked_at,
                consecutive_failures = CASE
                    WHEN EXCLUDED.healthy THEN 0
                    ELSE provider_health.consecutive_failures + 1
                END",
        )
        .bind(&health.gateway_id)
        .bind(health.healthy)
        .bind(&health.error)
        .bind(health.checked_at)
        .bind(i32::try_from(health.consecutive_failures).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    /// Append to the credential audit log.
    pub async fn record_credential_audit(
        &self,
        workspace_id: &str,
        action: &str,
        detail: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO credential_audit_log (workspace_id, action, detail) VALUES ($1, $2, $3)",
        )
        .bind(workspace_id)
        .bind(action)
        .bind(detail)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }
}
