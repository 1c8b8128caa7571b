//! PostgreSQL store

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::{EntitlementStore, UsagePeriod};
use crate::config::ResourceKind;
use crate::error::{EntitlementError, EntitlementResult};
use crate::history::HistoryEntry;
use crate::models::{
    FeatureAddon, LimitOverride, OrganizationSubscription, PlanFeature, PlanLimit,
    SubscriptionPlan, UsageRecord,
};
use crate::types::SubscriptionStatus;

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, organization_id, plan_id, status, started_at, expires_at, trial_ends_at,
    grace_period_ends_at, readonly_period_ends_at, cancelled_at, billing_period,
    next_maintenance_due_at, last_maintenance_paid_at, license_paid_at, license_payment_id,
    additional_schools, currency, amount_paid_cents, suspension_reason, notes, metadata,
    created_at, superseded_at
"#;

#[derive(Clone)]
pub struct PgEntitlementStore {
    pool: PgPool,
}

impl PgEntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn run_migrations(&self) -> EntitlementResult<()> {
        tracing::info!("Running entitlement migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Entitlement migrations completed");
        Ok(())
    }
}

/// Table and column names come from the catalog document; only plain
/// identifiers are spliced into SQL.
fn is_safe_identifier(ident: &str) -> bool {
    !ident.is_empty()
        && ident.len() <= 63
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !ident.starts_with(|c: char| c.is_ascii_digit())
}

pub(crate) fn count_query(resource_key: &str, kind: &ResourceKind) -> EntitlementResult<String> {
    let ResourceKind::Countable {
        table,
        active_column,
        soft_delete,
    } = kind
    else {
        return Err(EntitlementError::InvalidInput(format!(
            "{} is not a countable resource",
            resource_key
        )));
    };

    if !is_safe_identifier(table) {
        return Err(EntitlementError::Config(format!(
            "invalid table name for {}: {}",
            resource_key, table
        )));
    }

    let mut sql = format!("SELECT COUNT(*) FROM {} WHERE organization_id = $1", table);
    if *soft_delete {
        sql.push_str(" AND deleted_at IS NULL");
    }
    if let Some(column) = active_column {
        if !is_safe_identifier(column) {
            return Err(EntitlementError::Config(format!(
                "invalid active column for {}: {}",
                resource_key, column
            )));
        }
        sql.push_str(&format!(" AND {} = TRUE", column));
    }
    Ok(sql)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Claim `payment_id` inside the subscription write. The primary key turns a
/// second claim, concurrent or not, into `PaymentAlreadyApplied`.
async fn claim_payment(
    tx: &mut Transaction<'_, Postgres>,
    payment_id: &str,
    subscription: &OrganizationSubscription,
) -> EntitlementResult<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO applied_payments (payment_id, organization_id, subscription_id, applied_at)
        VALUES ($1, $2, $3, NOW())
        ON CONFLICT (payment_id) DO NOTHING
        "#,
    )
    .bind(payment_id)
    .bind(subscription.organization_id)
    .bind(subscription.id)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EntitlementError::PaymentAlreadyApplied(payment_id.to_string()));
    }
    Ok(())
}

#[async_trait]
impl EntitlementStore for PgEntitlementStore {
    async fn list_plans(&self) -> EntitlementResult<Vec<SubscriptionPlan>> {
        let plans = sqlx::query_as::<_, SubscriptionPlan>(
            r#"
            SELECT id, slug, name, description,
                   license_fee_afn_cents, license_fee_usd_cents,
                   maintenance_fee_afn_cents, maintenance_fee_usd_cents,
                   per_school_maintenance_afn_cents, per_school_maintenance_usd_cents,
                   trial_days, grace_period_days, readonly_period_days,
                   billing_period, custom_billing_days, max_schools, sort_order,
                   is_active, is_custom
            FROM subscription_plans
            ORDER BY sort_order, slug
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    async fn list_plan_features(&self) -> EntitlementResult<Vec<PlanFeature>> {
        let features = sqlx::query_as::<_, PlanFeature>(
            "SELECT plan_id, feature_key, is_enabled FROM plan_features",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(features)
    }

    async fn list_plan_limits(&self) -> EntitlementResult<Vec<PlanLimit>> {
        let limits = sqlx::query_as::<_, PlanLimit>(
            "SELECT plan_id, resource_key, limit_value, warning_threshold FROM plan_limits",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(limits)
    }

    async fn current_subscription(
        &self,
        organization_id: Uuid,
    ) -> EntitlementResult<Option<OrganizationSubscription>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM organization_subscriptions
            WHERE organization_id = $1 AND superseded_at IS NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let sub = sqlx::query_as::<_, OrganizationSubscription>(&sql)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(sub)
    }

    async fn replace_subscription(
        &self,
        previous: Option<Uuid>,
        next: &OrganizationSubscription,
        payment_id: Option<&str>,
    ) -> EntitlementResult<()> {
        let mut tx = self.pool.begin().await?;

        if let Some(previous) = previous {
            let result = sqlx::query(
                r#"
                UPDATE organization_subscriptions
                SET superseded_at = $2, updated_at = NOW()
                WHERE id = $1 AND superseded_at IS NULL
                "#,
            )
            .bind(previous)
            .bind(next.created_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() != 1 {
                return Err(EntitlementError::ConcurrentModification(format!(
                    "subscription {} is no longer current",
                    previous
                )));
            }
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO organization_subscriptions (
                id, organization_id, plan_id, status, started_at, expires_at, trial_ends_at,
                grace_period_ends_at, readonly_period_ends_at, cancelled_at, billing_period,
                next_maintenance_due_at, last_maintenance_paid_at, license_paid_at,
                license_payment_id, additional_schools, currency, amount_paid_cents,
                suspension_reason, notes, metadata, created_at, superseded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23)
            "#,
        )
        .bind(next.id)
        .bind(next.organization_id)
        .bind(next.plan_id)
        .bind(next.status)
        .bind(next.started_at)
        .bind(next.expires_at)
        .bind(next.trial_ends_at)
        .bind(next.grace_period_ends_at)
        .bind(next.readonly_period_ends_at)
        .bind(next.cancelled_at)
        .bind(next.billing_period)
        .bind(next.next_maintenance_due_at)
        .bind(next.last_maintenance_paid_at)
        .bind(next.license_paid_at)
        .bind(&next.license_payment_id)
        .bind(next.additional_schools)
        .bind(next.currency)
        .bind(next.amount_paid_cents)
        .bind(&next.suspension_reason)
        .bind(&next.notes)
        .bind(&next.metadata)
        .bind(next.created_at)
        .bind(next.superseded_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(EntitlementError::ConcurrentModification(format!(
                    "organization {} already has a current subscription",
                    next.organization_id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(payment_id) = payment_id {
            claim_payment(&mut tx, payment_id, next).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_subscription_if_status(
        &self,
        subscription: &OrganizationSubscription,
        expected: SubscriptionStatus,
        payment_id: Option<&str>,
    ) -> EntitlementResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE organization_subscriptions
            SET status = $3,
                expires_at = $4,
                grace_period_ends_at = $5,
                readonly_period_ends_at = $6,
                cancelled_at = $7,
                next_maintenance_due_at = $8,
                last_maintenance_paid_at = $9,
                license_paid_at = $10,
                license_payment_id = $11,
                suspension_reason = $12,
                notes = $13,
                metadata = $14,
                updated_at = NOW()
            WHERE id = $1 AND status = $2 AND superseded_at IS NULL
            "#,
        )
        .bind(subscription.id)
        .bind(expected)
        .bind(subscription.status)
        .bind(subscription.expires_at)
        .bind(subscription.grace_period_ends_at)
        .bind(subscription.readonly_period_ends_at)
        .bind(subscription.cancelled_at)
        .bind(subscription.next_maintenance_due_at)
        .bind(subscription.last_maintenance_paid_at)
        .bind(subscription.license_paid_at)
        .bind(&subscription.license_payment_id)
        .bind(&subscription.suspension_reason)
        .bind(&subscription.notes)
        .bind(&subscription.metadata)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            return Ok(false);
        }
        if let Some(payment_id) = payment_id {
            claim_payment(&mut tx, payment_id, subscription).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn subscriptions_in_status(
        &self,
        statuses: &[SubscriptionStatus],
    ) -> EntitlementResult<Vec<OrganizationSubscription>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            r#"
            SELECT {}
            FROM organization_subscriptions
            WHERE superseded_at IS NULL AND status = ANY($1)
            ORDER BY expires_at NULLS LAST
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let subs = sqlx::query_as::<_, OrganizationSubscription>(&sql)
            .bind(&statuses)
            .fetch_all(&self.pool)
            .await?;
        Ok(subs)
    }

    async fn organizations_with_multiple_current(&self) -> EntitlementResult<Vec<(Uuid, i64)>> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT organization_id, COUNT(*)
            FROM organization_subscriptions
            WHERE superseded_at IS NULL
            GROUP BY organization_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn feature_addons(&self, organization_id: Uuid) -> EntitlementResult<Vec<FeatureAddon>> {
        let addons = sqlx::query_as::<_, FeatureAddon>(
            r#"
            SELECT id, organization_id, feature_key, is_enabled, started_at, expires_at,
                   price_paid_cents, currency, created_at, deleted_at
            FROM organization_feature_addons
            WHERE organization_id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(addons)
    }

    async fn all_feature_addons(&self) -> EntitlementResult<Vec<FeatureAddon>> {
        let addons = sqlx::query_as::<_, FeatureAddon>(
            r#"
            SELECT id, organization_id, feature_key, is_enabled, started_at, expires_at,
                   price_paid_cents, currency, created_at, deleted_at
            FROM organization_feature_addons
            WHERE deleted_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(addons)
    }

    async fn upsert_feature_addon(&self, addon: &FeatureAddon) -> EntitlementResult<()> {
        sqlx::query(
            r#"
            INSERT INTO organization_feature_addons (
                id, organization_id, feature_key, is_enabled, started_at, expires_at,
                price_paid_cents, currency, created_at, deleted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (organization_id, feature_key) DO UPDATE
            SET is_enabled = EXCLUDED.is_enabled,
                started_at = EXCLUDED.started_at,
                expires_at = EXCLUDED.expires_at,
                price_paid_cents = EXCLUDED.price_paid_cents,
                currency = EXCLUDED.currency,
                deleted_at = EXCLUDED.deleted_at,
                updated_at = NOW()
            "#,
        )
        .bind(addon.id)
        .bind(addon.organization_id)
        .bind(&addon.feature_key)
        .bind(addon.is_enabled)
        .bind(addon.started_at)
        .bind(addon.expires_at)
        .bind(addon.price_paid_cents)
        .bind(addon.currency)
        .bind(addon.created_at)
        .bind(addon.deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn limit_override(
        &self,
        organization_id: Uuid,
        resource_key: &str,
    ) -> EntitlementResult<Option<LimitOverride>> {
        let row = sqlx::query_as::<_, LimitOverride>(
            r#"
            SELECT id, organization_id, resource_key, limit_value, reason, granted_by,
                   expires_at, created_at
            FROM organization_limit_overrides
            WHERE organization_id = $1 AND resource_key = $2
            "#,
        )
        .bind(organization_id)
        .bind(resource_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert_limit_override(&self, limit_override: &LimitOverride) -> EntitlementResult<()> {
        sqlx::query(
            r#"
            INSERT INTO organization_limit_overrides (
                id, organization_id, resource_key, limit_value, reason, granted_by,
                expires_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (organization_id, resource_key) DO UPDATE
            SET limit_value = EXCLUDED.limit_value,
                reason = EXCLUDED.reason,
                granted_by = EXCLUDED.granted_by,
                expires_at = EXCLUDED.expires_at,
                updated_at = NOW()
            "#,
        )
        .bind(limit_override.id)
        .bind(limit_override.organization_id)
        .bind(&limit_override.resource_key)
        .bind(limit_override.limit_value)
        .bind(&limit_override.reason)
        .bind(limit_override.granted_by)
        .bind(limit_override.expires_at)
        .bind(limit_override.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn usage_record(
        &self,
        organization_id: Uuid,
        resource_key: &str,
    ) -> EntitlementResult<Option<UsageRecord>> {
        let row = sqlx::query_as::<_, UsageRecord>(
            r#"
            SELECT organization_id, resource_key, current_count, period_start, period_end,
                   last_calculated_at, last_warning_sent_at
            FROM usage_current
            WHERE organization_id = $1 AND resource_key = $2
            "#,
        )
        .bind(organization_id)
        .bind(resource_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn store_usage_count(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        count: i64,
        calculated_at: OffsetDateTime,
    ) -> EntitlementResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_current (
                organization_id, resource_key, current_count, last_calculated_at
            )
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (organization_id, resource_key) DO UPDATE
            SET current_count = EXCLUDED.current_count,
                last_calculated_at = EXCLUDED.last_calculated_at
            "#,
        )
        .bind(organization_id)
        .bind(resource_key)
        .bind(count)
        .bind(calculated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_usage_period(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        period: UsagePeriod,
        now: OffsetDateTime,
    ) -> EntitlementResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_current (
                organization_id, resource_key, current_count, period_start, period_end,
                last_calculated_at
            )
            VALUES ($1, $2, 0, $3, $4, $5)
            ON CONFLICT (organization_id, resource_key) DO UPDATE
            SET current_count = 0,
                period_start = EXCLUDED.period_start,
                period_end = EXCLUDED.period_end,
                last_calculated_at = EXCLUDED.last_calculated_at,
                last_warning_sent_at = NULL
            "#,
        )
        .bind(organization_id)
        .bind(resource_key)
        .bind(period.start)
        .bind(period.end)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn adjust_usage(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        delta: i64,
        period: Option<UsagePeriod>,
        now: OffsetDateTime,
    ) -> EntitlementResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO usage_current (
                organization_id, resource_key, current_count, period_start, period_end,
                last_calculated_at
            )
            VALUES ($1, $2, GREATEST($3, 0), $4, $5, $6)
            ON CONFLICT (organization_id, resource_key) DO UPDATE
            SET current_count = GREATEST(usage_current.current_count + $3, 0),
                last_calculated_at = EXCLUDED.last_calculated_at
            RETURNING current_count
            "#,
        )
        .bind(organization_id)
        .bind(resource_key)
        .bind(delta)
        .bind(period.map(|p| p.start))
        .bind(period.map(|p| p.end))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn claim_limit_notification(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        now: OffsetDateTime,
        cooldown: Duration,
    ) -> EntitlementResult<bool> {
        let claimed: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO usage_current (
                organization_id, resource_key, current_count, last_calculated_at,
                last_warning_sent_at
            )
            VALUES ($1, $2, 0, $3, $3)
            ON CONFLICT (organization_id, resource_key) DO UPDATE
            SET last_warning_sent_at = EXCLUDED.last_warning_sent_at
            WHERE usage_current.last_warning_sent_at IS NULL
               OR usage_current.last_warning_sent_at <= $4
            RETURNING current_count
            "#,
        )
        .bind(organization_id)
        .bind(resource_key)
        .bind(now)
        .bind(now - cooldown)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn count_resource(
        &self,
        organization_id: Uuid,
        resource_key: &str,
        kind: &ResourceKind,
    ) -> EntitlementResult<i64> {
        let sql = count_query(resource_key, kind)?;
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(organization_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn negative_usage_rows(&self) -> EntitlementResult<Vec<(Uuid, String, i64)>> {
        let rows: Vec<(Uuid, String, i64)> = sqlx::query_as(
            r#"
            SELECT organization_id, resource_key, current_count
            FROM usage_current
            WHERE current_count < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn append_history(&self, entry: &HistoryEntry) -> EntitlementResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_history (
                id, organization_id, subscription_id, action, from_plan_id, to_plan_id,
                from_status, to_status, performed_by, notes, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(entry.id)
        .bind(entry.organization_id)
        .bind(entry.subscription_id)
        .bind(entry.action)
        .bind(entry.from_plan_id)
        .bind(entry.to_plan_id)
        .bind(entry.from_status)
        .bind(entry.to_status)
        .bind(entry.performed_by)
        .bind(&entry.notes)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn history(&self, organization_id: Uuid) -> EntitlementResult<Vec<HistoryEntry>> {
        let entries = sqlx::query_as::<_, HistoryEntry>(
            r#"
            SELECT id, organization_id, subscription_id, action, from_plan_id, to_plan_id,
                   from_status, to_status, performed_by, notes, metadata, created_at
            FROM subscription_history
            WHERE organization_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn payment_applied(&self, payment_id: &str) -> EntitlementResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM applied_payments WHERE payment_id = $1
            )
            "#,
        )
        .bind(payment_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}
