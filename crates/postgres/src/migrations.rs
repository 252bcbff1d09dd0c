use sqlx::PgPool;

use courier_store::StoreError;

/// Idempotent schema setup, run at store construction.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    const STATEMENTS: &[&str] = &[
        "CREATE TABLE IF NOT EXISTS messages (
            id UUID PRIMARY KEY,
            from_address TEXT NOT NULL,
            to_addresses JSONB NOT NULL,
            cc_addresses JSONB NOT NULL DEFAULT '[]',
            bcc_addresses JSONB NOT NULL DEFAULT '[]',
            subject TEXT NOT NULL DEFAULT '',
            html TEXT,
            text_body TEXT,
            headers JSONB NOT NULL DEFAULT '{}',
            attachments JSONB NOT NULL DEFAULT '[]',
            workspace_id TEXT,
            campaign_id TEXT,
            user_id TEXT,
            invitation_id TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            queued_at TIMESTAMPTZ NOT NULL,
            processed_at TIMESTAMPTZ,
            sent_at TIMESTAMPTZ,
            status TEXT NOT NULL,
            error TEXT,
            provider_id TEXT
        )",
        "CREATE INDEX IF NOT EXISTS idx_messages_dispatch
            ON messages (status, queued_at)",
        "CREATE INDEX IF NOT EXISTS idx_messages_sent_at
            ON messages (sent_at) WHERE sent_at IS NOT NULL",
        "CREATE INDEX IF NOT EXISTS idx_messages_campaign
            ON messages (campaign_id) WHERE campaign_id IS NOT NULL",
        "CREATE TABLE IF NOT EXISTS workspaces (
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            kind TEXT NOT NULL,
            domain TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            weight INTEGER NOT NULL DEFAULT 1,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            credentials JSONB NOT NULL,
            tracking JSONB NOT NULL DEFAULT '{}',
            header_rewrites JSONB NOT NULL DEFAULT '{}',
            can_route BOOLEAN NOT NULL DEFAULT TRUE,
            exclude_patterns JSONB NOT NULL DEFAULT '[]',
            failover_to JSONB NOT NULL DEFAULT '[]',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
        "CREATE TABLE IF NOT EXISTS workspace_rate_limits (
            workspace_id TEXT PRIMARY KEY REFERENCES workspaces(id) ON DELETE CASCADE,
            workspace_daily BIGINT,
            per_user_daily BIGINT,
            per_user_hourly BIGINT,
            burst_limit BIGINT
        )",
        "CREATE TABLE IF NOT EXISTS workspace_user_rate_limits (
            workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
            email TEXT NOT NULL,
            daily_limit BIGINT NOT NULL,
            PRIMARY KEY (workspace_id, email)
        )",
        "CREATE TABLE IF NOT EXISTS load_balancing_pools (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            strategy TEXT NOT NULL,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            is_default BOOLEAN NOT NULL DEFAULT FALSE
        )",
        "CREATE TABLE IF NOT EXISTS pool_domain_patterns (
            pool_id TEXT NOT NULL REFERENCES load_balancing_pools(id) ON DELETE CASCADE,
            pattern TEXT NOT NULL,
            PRIMARY KEY (pool_id, pattern)
        )",
        "CREATE TABLE IF NOT EXISTS pool_members (
            pool_id TEXT NOT NULL REFERENCES load_balancing_pools(id) ON DELETE CASCADE,
            gateway_id TEXT NOT NULL,
            weight INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 0,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            position INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (pool_id, gateway_id)
        )",
        "CREATE TABLE IF NOT EXISTS recipients (
            id UUID PRIMARY KEY,
            workspace_id TEXT NOT NULL,
            email_address TEXT NOT NULL,
            user_id TEXT,
            campaign_id TEXT,
            first_name TEXT,
            last_name TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            opt_in_date TIMESTAMPTZ,
            opt_out_date TIMESTAMPTZ,
            bounce_count INTEGER NOT NULL DEFAULT 0,
            last_bounce_date TIMESTAMPTZ,
            bounce_type TEXT,
            metadata JSONB NOT NULL DEFAULT 'null',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (workspace_id, email_address)
        )",
        "CREATE TABLE IF NOT EXISTS message_recipients (
            id UUID PRIMARY KEY,
            message_id UUID NOT NULL,
            recipient_id UUID NOT NULL REFERENCES recipients(id) ON DELETE CASCADE,
            recipient_type TEXT NOT NULL,
            delivery_status TEXT NOT NULL DEFAULT 'pending',
            sent_at TIMESTAMPTZ,
            bounce_reason TEXT,
            gateway_id TEXT,
            gateway_kind TEXT,
            send_attempt_count INTEGER NOT NULL DEFAULT 0,
            last_send_attempt TIMESTAMPTZ,
            opens INTEGER NOT NULL DEFAULT 0,
            clicks INTEGER NOT NULL DEFAULT 0,
            last_open_at TIMESTAMPTZ,
            last_click_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (message_id, recipient_id, recipient_type)
        )",
        "CREATE INDEX IF NOT EXISTS idx_message_recipients_message
            ON message_recipients (message_id)",
        "CREATE INDEX IF NOT EXISTS idx_message_recipients_recipient
            ON message_recipients (recipient_id)",
        "CREATE TABLE IF NOT EXISTS recipient_events (
            id UUID PRIMARY KEY,
            message_recipient_id UUID NOT NULL REFERENCES message_recipients(id) ON DELETE CASCADE,
            event_type TEXT NOT NULL,
            event_data JSONB NOT NULL DEFAULT 'null',
            ip_address TEXT,
            user_agent TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
        "CREATE INDEX IF NOT EXISTS idx_recipient_events_mr
            ON recipient_events (message_recipient_id)",
        "CREATE TABLE IF NOT EXISTS provider_health (
            gateway_id TEXT PRIMARY KEY,
            healthy BOOLEAN NOT NULL,
            error TEXT,
            checked_at TIMESTAMPTZ NOT NULL,
            consecutive_failures INTEGER NOT NULL DEFAULT 0
        )",
        "CREATE TABLE IF NOT EXISTS credential_audit_log (
            id BIGSERIAL PRIMARY KEY,
            workspace_id TEXT NOT NULL,
            action TEXT NOT NULL,
            detail TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    ];

    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {e}")))?;
    }
    Ok(())
}
