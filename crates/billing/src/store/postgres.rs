//! PostgreSQL-backed `UserStore`

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use quotagate_shared::{PlanTier, UserRecord};
use sqlx::PgPool;
use time::OffsetDateTime;

use super::UserStore;
use crate::error::{BillingError, BillingResult};

const USER_COLUMNS: &str = "identity, display_name, plan, usage_count, last_used_at, \
     subscription_started_at, payment_customer_id, payment_subscription_id, \
     conversation_token, version";

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    identity: String,
    display_name: String,
    plan: String,
    usage_count: i32,
    last_used_at: OffsetDateTime,
    subscription_started_at: Option<OffsetDateTime>,
    payment_customer_id: Option<String>,
    payment_subscription_id: Option<String>,
    conversation_token: Option<String>,
    version: i64,
}

impl TryFrom<UserRow> for UserRecord {
    type Error = BillingError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let plan: PlanTier = row
            .plan
            .parse()
            .map_err(|e| BillingError::Database(format!("row {}: {}", row.identity, e)))?;
        let usage_count = u32::try_from(row.usage_count).map_err(|_| {
            BillingError::Database(format!(
                "row {}: negative usage_count {}",
                row.identity, row.usage_count
            ))
        })?;

        Ok(UserRecord {
            identity: row.identity,
            display_name: row.display_name,
            plan,
            usage_count,
            last_used_at: row.last_used_at,
            subscription_started_at: row.subscription_started_at,
            payment_customer_id: row.payment_customer_id,
            payment_subscription_id: row.payment_subscription_id,
            conversation_token: row.conversation_token,
            version: row.version,
        })
    }
}

fn usage_to_db(record: &UserRecord) -> BillingResult<i32> {
    i32::try_from(record.usage_count).map_err(|_| {
        BillingError::InvalidInput(format!(
            "usage_count {} out of range for {}",
            record.usage_count, record.identity
        ))
    })
}

/// `line_users` table access. Every statement is bounded by `timeout`.
#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgUserStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn timed<T, F>(&self, operation: &'static str, query: F) -> BillingResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>> + Send,
    {
        match tokio::time::timeout(self.timeout, query).await {
            Ok(result) => result.map_err(|e| {
                tracing::error!(dependency = "postgres", operation, error = %e, "Store call failed");
                BillingError::from(e)
            }),
            Err(_) => {
                tracing::error!(
                    dependency = "postgres",
                    operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Store call timed out"
                );
                Err(BillingError::StoreTimeout(self.timeout.as_millis() as u64))
            }
        }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn get(&self, identity: &str) -> BillingResult<Option<UserRecord>> {
        let sql = format!("SELECT {} FROM line_users WHERE identity = $1", USER_COLUMNS);
        let row: Option<UserRow> = self
            .timed(
                "get",
                sqlx::query_as(&sql).bind(identity).fetch_optional(&self.pool),
            )
            .await?;
        row.map(UserRecord::try_from).transpose()
    }

    async fn create(&self, record: &UserRecord) -> BillingResult<UserRecord> {
        let usage = usage_to_db(record)?;
        let result = self
            .timed(
                "create",
                sqlx::query(
                    r#"
                    INSERT INTO line_users (
                        identity, display_name, plan, usage_count, last_used_at,
                        subscription_started_at, payment_customer_id,
                        payment_subscription_id, conversation_token
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    ON CONFLICT (identity) DO NOTHING
                    "#,
                )
                .bind(&record.identity)
                .bind(&record.display_name)
                .bind(record.plan.as_str())
                .bind(usage)
                .bind(record.last_used_at)
                .bind(record.subscription_started_at)
                .bind(&record.payment_customer_id)
                .bind(&record.payment_subscription_id)
                .bind(&record.conversation_token)
                .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(identity = %record.identity, "User already exists, returning stored row");
        }

        self.get(&record.identity)
            .await?
            .ok_or_else(|| BillingError::UserNotFound(record.identity.clone()))
    }

    async fn compare_and_swap(&self, record: &UserRecord) -> BillingResult<Option<UserRecord>> {
        let usage = usage_to_db(record)?;
        let sql = format!(
            r#"
            UPDATE line_users
            SET display_name = $2,
                plan = $3,
                usage_count = $4,
                last_used_at = $5,
                subscription_started_at = $6,
                payment_customer_id = $7,
                payment_subscription_id = $8,
                conversation_token = $9,
                version = version + 1,
                updated_at = NOW()
            WHERE identity = $1 AND version = $10
            RETURNING {}
            "#,
            USER_COLUMNS
        );

        let row: Option<UserRow> = self
            .timed(
                "compare_and_swap",
                sqlx::query_as(&sql)
                    .bind(&record.identity)
                    .bind(&record.display_name)
                    .bind(record.plan.as_str())
                    .bind(usage)
                    .bind(record.last_used_at)
                    .bind(record.subscription_started_at)
                    .bind(&record.payment_customer_id)
                    .bind(&record.payment_subscription_id)
                    .bind(&record.conversation_token)
                    .bind(record.version)
                    .fetch_optional(&self.pool),
            )
            .await?;
        row.map(UserRecord::try_from).transpose()
    }

    async fn find_by_payment_customer_id(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<UserRecord>> {
        let sql = format!(
            "SELECT {} FROM line_users WHERE payment_customer_id = $1 \
             ORDER BY updated_at DESC LIMIT 1",
            USER_COLUMNS
        );
        let row: Option<UserRow> = self
            .timed(
                "find_by_payment_customer_id",
                sqlx::query_as(&sql)
                    .bind(customer_id)
                    .fetch_optional(&self.pool),
            )
            .await?;
        row.map(UserRecord::try_from).transpose()
    }

    async fn reset_all_free_usage(&self) -> BillingResult<u64> {
        let result = self
            .timed(
                "reset_all_free_usage",
                sqlx::query(
                    r#"
                    UPDATE line_users
                    SET usage_count = 0, version = version + 1, updated_at = NOW()
                    WHERE plan = 'free' AND usage_count > 0
                    "#,
                )
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected())
    }

    async fn claim_reset_period(&self, period: &str) -> BillingResult<bool> {
        let result = self
            .timed(
                "claim_reset_period",
                sqlx::query(
                    "INSERT INTO usage_resets (period) VALUES ($1) ON CONFLICT (period) DO NOTHING",
                )
                .bind(period)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_free_usage_once(&self, period: &str) -> BillingResult<Option<u64>> {
        let work = async {
            let mut tx = self.pool.begin().await?;

            let claimed = sqlx::query(
                "INSERT INTO usage_resets (period) VALUES ($1) ON CONFLICT (period) DO NOTHING",
            )
            .bind(period)
            .execute(&mut *tx)
            .await?;
            if claimed.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok::<_, sqlx::Error>(None);
            }

            let reset = sqlx::query(
                r#"
                UPDATE line_users
                SET usage_count = 0, version = version + 1, updated_at = NOW()
                WHERE plan = 'free' AND usage_count > 0
                "#,
            )
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok::<_, sqlx::Error>(Some(reset.rows_affected()))
        };

        self.timed("reset_free_usage_once", work).await
    }
}
