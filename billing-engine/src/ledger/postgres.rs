//! PostgreSQL ledger.

use super::{Ledger, RunLease, Settlement};
use crate::models::{
    BatchItemStatus, BatchStatus, BatchTotals, CreatePlan, DueSubscription, NewBatch,
    NewBatchItem, NewTransaction, PaymentBatch, PaymentBatchItem, PaymentTransaction,
    Subscription, SubscriptionPlan, SubscriptionStatus, SubscriptionUpdate, TransactionStatus,
    TransactionType, User,
};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Session advisory lock key shared by every engine instance ("BILLRUN").
const RUN_LOCK_KEY: i64 = 0x4249_4C4C_5255_4E00;

const BATCH_COLUMNS: &str = "batch_id, batch_code, run_date, dry_run, status, total_processed, \
    total_successful, total_failed, total_amount_processed, total_amount_successful, \
    started_at, completed_at, error_message, created_at";

const ITEM_COLUMNS: &str = "item_id, batch_id, user_id, subscription_id, transaction_id, amount, \
    status, error_message, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "transaction_id, user_id, subscription_id, batch_item_id, \
    transaction_type, amount, currency, status, external_id, failure_reason, gateway_response, \
    created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, user_id, plan_id, status, next_billing_date, \
    ends_at, cancelled_at, created_at, updated_at";

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", context, e))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

/// Dedicated connection holding the session advisory lock.
struct PgRunLease {
    conn: Option<PoolConnection<Postgres>>,
}

impl Drop for PgRunLease {
    fn drop(&mut self) {
        // Never hand a locked session back to the pool; closing it frees the lock.
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl RunLease for PgRunLease {
    async fn release(mut self: Box<Self>) -> Result<(), AppError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        match sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(RUN_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                drop(conn.detach());
                Err(db_error("release run lock", e))
            }
        }
    }
}

impl PgLedger {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-engine"))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Reference data (owned by the surrounding application; used for seeding)
    // =========================================================================

    pub async fn insert_user(&self, email: &str, name: Option<&str>) -> Result<User, AppError> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (user_id, email, name)
            VALUES ($1, $2, $3)
            RETURNING user_id, email, name
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("insert user", e))
    }

    pub async fn insert_plan(&self, input: &CreatePlan) -> Result<SubscriptionPlan, AppError> {
        sqlx::query_as::<_, SubscriptionPlan>(
            r#"
            INSERT INTO subscription_plans (plan_id, name, price, currency, billing_interval, interval_count)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING plan_id, name, price, currency, billing_interval, interval_count, is_active, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(input.price)
        .bind(&input.currency)
        .bind(input.billing_interval.as_str())
        .bind(input.interval_count)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("insert plan", e))
    }

    pub async fn insert_subscription(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        status: SubscriptionStatus,
        next_billing_date: Option<DateTime<Utc>>,
    ) -> Result<Subscription, AppError> {
        sqlx::query_as::<_, Subscription>(&format!(
            r#"
            INSERT INTO subscriptions (subscription_id, user_id, plan_id, status, next_billing_date, ends_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(plan_id)
        .bind(status.as_str())
        .bind(next_billing_date)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("insert subscription", e))
    }

    async fn insert_transaction(
        tx: &mut Transaction<'_, Postgres>,
        input: &NewTransaction,
    ) -> Result<PaymentTransaction, AppError> {
        sqlx::query_as::<_, PaymentTransaction>(&format!(
            r#"
            INSERT INTO payment_transactions (transaction_id, user_id, subscription_id, batch_item_id, transaction_type, amount, currency, status, external_id, failure_reason, gateway_response)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.user_id)
        .bind(input.subscription_id)
        .bind(input.batch_item_id)
        .bind(input.transaction_type.as_str())
        .bind(input.amount)
        .bind(&input.currency)
        .bind(input.status.as_str())
        .bind(&input.external_id)
        .bind(&input.failure_reason)
        .bind(&input.gateway_response)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| db_error("insert transaction", e))
    }
}

#[async_trait]
impl Ledger for PgLedger {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Run coordination
    // =========================================================================

    #[instrument(skip(self))]
    async fn try_acquire_run_lock(&self) -> Result<Option<Box<dyn RunLease>>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["try_acquire_run_lock"])
            .start_timer();

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| db_error("acquire connection for run lock", e))?;

        let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(RUN_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| db_error("acquire run lock", e))?;

        timer.observe_duration();

        if acquired {
            Ok(Some(Box::new(PgRunLease { conn: Some(conn) })))
        } else {
            Ok(None)
        }
    }

    #[instrument(skip(self))]
    async fn list_running_batches(&self) -> Result<Vec<PaymentBatch>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_running_batches"])
            .start_timer();

        let batches = sqlx::query_as::<_, PaymentBatch>(&format!(
            "SELECT {} FROM payment_batches WHERE status = $1 ORDER BY created_at",
            BATCH_COLUMNS
        ))
        .bind(BatchStatus::Running.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list running batches", e))?;

        timer.observe_duration();
        Ok(batches)
    }

    // =========================================================================
    // Batches
    // =========================================================================

    #[instrument(skip(self, input), fields(batch_code = %input.batch_code, dry_run = input.dry_run))]
    async fn create_batch(&self, input: &NewBatch) -> Result<PaymentBatch, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_batch"])
            .start_timer();

        let batch = sqlx::query_as::<_, PaymentBatch>(&format!(
            r#"
            INSERT INTO payment_batches (batch_id, batch_code, run_date, dry_run, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {}
            "#,
            BATCH_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&input.batch_code)
        .bind(input.run_date)
        .bind(input.dry_run)
        .bind(BatchStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!(
                    "Batch code {} already exists",
                    input.batch_code
                ))
            } else {
                db_error("create batch", e)
            }
        })?;

        timer.observe_duration();
        info!(batch_id = %batch.batch_id, "Batch created");

        Ok(batch)
    }

    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn mark_batch_running(
        &self,
        batch_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_batch_running"])
            .start_timer();

        let result = sqlx::query(
            "UPDATE payment_batches SET status = $2, started_at = $3 WHERE batch_id = $1",
        )
        .bind(batch_id)
        .bind(BatchStatus::Running.as_str())
        .bind(started_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("mark batch running", e))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Batch {} not found",
                batch_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, totals), fields(batch_id = %batch_id))]
    async fn complete_batch(
        &self,
        batch_id: Uuid,
        totals: &BatchTotals,
        completed_at: DateTime<Utc>,
    ) -> Result<PaymentBatch, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_batch"])
            .start_timer();

        let batch = sqlx::query_as::<_, PaymentBatch>(&format!(
            r#"
            UPDATE payment_batches
            SET status = $2, total_processed = $3, total_successful = $4, total_failed = $5,
                total_amount_processed = $6, total_amount_successful = $7, completed_at = $8
            WHERE batch_id = $1
            RETURNING {}
            "#,
            BATCH_COLUMNS
        ))
        .bind(batch_id)
        .bind(BatchStatus::Completed.as_str())
        .bind(totals.processed)
        .bind(totals.successful)
        .bind(totals.failed)
        .bind(totals.amount_processed)
        .bind(totals.amount_successful)
        .bind(completed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("complete batch", e))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Batch {} not found", batch_id)))?;

        timer.observe_duration();
        Ok(batch)
    }

    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn fail_batch(
        &self,
        batch_id: Uuid,
        error_message: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["fail_batch"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE payment_batches
            SET status = $2, error_message = $3, completed_at = $4
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .bind(BatchStatus::Failed.as_str())
        .bind(error_message)
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("fail batch", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn batch_totals(&self, batch_id: Uuid) -> Result<BatchTotals, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["batch_totals"])
            .start_timer();

        let totals = sqlx::query_as::<_, BatchTotals>(
            r#"
            SELECT
                COUNT(*)::INT AS processed,
                COUNT(*) FILTER (WHERE status = 'succeeded')::INT AS successful,
                COUNT(*) FILTER (WHERE status = 'failed')::INT AS failed,
                COALESCE(SUM(amount), 0)::BIGINT AS amount_processed,
                COALESCE(SUM(amount) FILTER (WHERE status = 'succeeded'), 0)::BIGINT AS amount_successful
            FROM payment_batch_items
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("compute batch totals", e))?;

        timer.observe_duration();
        Ok(totals)
    }

    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<PaymentBatch>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_batch"])
            .start_timer();

        let batch = sqlx::query_as::<_, PaymentBatch>(&format!(
            "SELECT {} FROM payment_batches WHERE batch_id = $1",
            BATCH_COLUMNS
        ))
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get batch", e))?;

        timer.observe_duration();
        Ok(batch)
    }

    #[instrument(skip(self), fields(batch_id = %batch_id))]
    async fn list_batch_items(&self, batch_id: Uuid) -> Result<Vec<PaymentBatchItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_batch_items"])
            .start_timer();

        let items = sqlx::query_as::<_, PaymentBatchItem>(&format!(
            "SELECT {} FROM payment_batch_items WHERE batch_id = $1 ORDER BY created_at, item_id",
            ITEM_COLUMNS
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list batch items", e))?;

        timer.observe_duration();
        Ok(items)
    }

    async fn get_batch_item(&self, item_id: Uuid) -> Result<Option<PaymentBatchItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_batch_item"])
            .start_timer();

        let item = sqlx::query_as::<_, PaymentBatchItem>(&format!(
            "SELECT {} FROM payment_batch_items WHERE item_id = $1",
            ITEM_COLUMNS
        ))
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get batch item", e))?;

        timer.observe_duration();
        Ok(item)
    }

    #[instrument(skip(self))]
    async fn unresolved_items(&self) -> Result<Vec<PaymentBatchItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["unresolved_items"])
            .start_timer();

        let items = sqlx::query_as::<_, PaymentBatchItem>(
            r#"
            SELECT i.item_id, i.batch_id, i.user_id, i.subscription_id, i.transaction_id, i.amount,
                   i.status, i.error_message, i.created_at, i.updated_at
            FROM payment_batch_items i
            JOIN payment_batches b ON b.batch_id = i.batch_id
            WHERE i.status = 'pending' AND NOT b.dry_run
            ORDER BY i.created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list unresolved items", e))?;

        timer.observe_duration();
        Ok(items)
    }

    // =========================================================================
    // Batch items
    // =========================================================================

    #[instrument(skip(self, input), fields(batch_id = %input.batch_id, subscription_id = %input.subscription_id))]
    async fn create_batch_item(&self, input: &NewBatchItem) -> Result<PaymentBatchItem, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_batch_item"])
            .start_timer();

        let item = sqlx::query_as::<_, PaymentBatchItem>(&format!(
            r#"
            INSERT INTO payment_batch_items (item_id, batch_id, user_id, subscription_id, amount, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            ITEM_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.batch_id)
        .bind(input.user_id)
        .bind(input.subscription_id)
        .bind(input.amount)
        .bind(BatchItemStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!(
                    "Subscription {} already has an item in batch {}",
                    input.subscription_id,
                    input.batch_id
                ))
            } else {
                db_error("create batch item", e)
            }
        })?;

        timer.observe_duration();
        Ok(item)
    }

    #[instrument(skip(self, error_message), fields(item_id = %item_id, status = status.as_str()))]
    async fn finalize_batch_item(
        &self,
        item_id: Uuid,
        status: BatchItemStatus,
        transaction_id: Option<Uuid>,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finalize_batch_item"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE payment_batch_items
            SET status = $2, transaction_id = COALESCE($3, transaction_id), error_message = $4, updated_at = NOW()
            WHERE item_id = $1 AND status = 'pending'
            "#,
        )
        .bind(item_id)
        .bind(status.as_str())
        .bind(transaction_id)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("finalize batch item", e))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Batch item {} not found or no longer pending",
                item_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, settlement), fields(item_id = %settlement.item_id, subscription_id = %settlement.transaction.subscription_id))]
    async fn settle_charge(
        &self,
        settlement: &Settlement,
    ) -> Result<PaymentTransaction, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["settle_charge"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin settlement", e))?;

        let transaction = Self::insert_transaction(&mut tx, &settlement.transaction).await?;
        let subscription_id = settlement.transaction.subscription_id;

        let updated = match settlement.subscription_update {
            SubscriptionUpdate::Advance { next_billing_date } => sqlx::query(
                r#"
                UPDATE subscriptions
                SET next_billing_date = $2, ends_at = $2, updated_at = NOW()
                WHERE subscription_id = $1 AND status = 'active'
                "#,
            )
            .bind(subscription_id)
            .bind(next_billing_date)
            .execute(&mut *tx)
            .await,
            SubscriptionUpdate::PastDue => sqlx::query(
                r#"
                UPDATE subscriptions
                SET status = $2, updated_at = NOW()
                WHERE subscription_id = $1 AND status = 'active'
                "#,
            )
            .bind(subscription_id)
            .bind(SubscriptionStatus::PastDue.as_str())
            .execute(&mut *tx)
            .await,
        }
        .map_err(|e| db_error("update subscription", e))?;

        if updated.rows_affected() == 0 {
            warn!(
                subscription_id = %subscription_id,
                "Subscription no longer active, state left unchanged"
            );
        }

        let finalized = sqlx::query(
            r#"
            UPDATE payment_batch_items
            SET status = $2, transaction_id = $3, error_message = $4, updated_at = NOW()
            WHERE item_id = $1 AND status = 'pending'
            "#,
        )
        .bind(settlement.item_id)
        .bind(settlement.item_status.as_str())
        .bind(transaction.transaction_id)
        .bind(&settlement.item_error)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("finalize batch item", e))?;

        // Dropping `tx` here rolls back the transaction insert.
        if finalized.rows_affected() == 0 {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Batch item {} not found or no longer pending",
                settlement.item_id
            )));
        }

        tx.commit()
            .await
            .map_err(|e| db_error("commit settlement", e))?;

        timer.observe_duration();
        Ok(transaction)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    #[instrument(skip(self))]
    async fn due_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DueSubscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["due_subscriptions"])
            .start_timer();

        let due = sqlx::query_as::<_, DueSubscription>(
            r#"
            SELECT s.subscription_id, s.user_id, u.email AS user_email, u.name AS user_name,
                   p.plan_id, p.name AS plan_name, p.price, p.currency, p.billing_interval,
                   p.interval_count, s.next_billing_date
            FROM subscriptions s
            JOIN users u ON u.user_id = s.user_id
            JOIN subscription_plans p ON p.plan_id = s.plan_id
            WHERE s.status = 'active'
              AND s.next_billing_date IS NOT NULL
              AND s.next_billing_date <= $1
              AND p.billing_interval <> 'lifetime'
            ORDER BY s.next_billing_date, s.subscription_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("select due subscriptions", e))?;

        timer.observe_duration();
        Ok(due)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    async fn get_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {} FROM subscriptions WHERE subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get subscription", e))?;

        timer.observe_duration();
        Ok(subscription)
    }

    async fn get_plan(&self, plan_id: Uuid) -> Result<Option<SubscriptionPlan>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan"])
            .start_timer();

        let plan = sqlx::query_as::<_, SubscriptionPlan>(
            r#"
            SELECT plan_id, name, price, currency, billing_interval, interval_count, is_active, created_at, updated_at
            FROM subscription_plans
            WHERE plan_id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get plan", e))?;

        timer.observe_duration();
        Ok(plan)
    }

    #[instrument(skip(self), fields(subscription_id = %subscription_id, status = status.as_str()))]
    async fn update_subscription_status(
        &self,
        subscription_id: Uuid,
        status: SubscriptionStatus,
        cancelled_at: Option<DateTime<Utc>>,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_subscription_status"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE subscriptions
            SET status = $2, cancelled_at = COALESCE($3, cancelled_at), updated_at = NOW()
            WHERE subscription_id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .bind(status.as_str())
        .bind(cancelled_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("update subscription status", e))?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Subscription {} not found", subscription_id))
        })?;

        timer.observe_duration();
        Ok(subscription)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    #[instrument(skip(self, input), fields(subscription_id = %input.subscription_id))]
    async fn record_transaction(
        &self,
        input: &NewTransaction,
    ) -> Result<PaymentTransaction, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_transaction"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;
        let transaction = Self::insert_transaction(&mut tx, input).await?;
        tx.commit()
            .await
            .map_err(|e| db_error("commit transaction", e))?;

        timer.observe_duration();
        Ok(transaction)
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let transaction = sqlx::query_as::<_, PaymentTransaction>(&format!(
            "SELECT {} FROM payment_transactions WHERE transaction_id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get transaction", e))?;

        timer.observe_duration();
        Ok(transaction)
    }

    #[instrument(skip(self))]
    async fn find_charge_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_charge_by_external_id"])
            .start_timer();

        let transaction = sqlx::query_as::<_, PaymentTransaction>(&format!(
            r#"
            SELECT {} FROM payment_transactions
            WHERE external_id = $1 AND transaction_type = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(external_id)
        .bind(TransactionType::Charge.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find charge by external id", e))?;

        timer.observe_duration();
        Ok(transaction)
    }

    #[instrument(skip(self, failure_reason), fields(transaction_id = %transaction_id))]
    async fn update_transaction_status(
        &self,
        transaction_id: Uuid,
        expected: TransactionStatus,
        status: TransactionStatus,
        failure_reason: Option<&str>,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_transaction_status"])
            .start_timer();

        let transaction = sqlx::query_as::<_, PaymentTransaction>(&format!(
            r#"
            UPDATE payment_transactions
            SET status = $3, failure_reason = COALESCE($4, failure_reason), updated_at = NOW()
            WHERE transaction_id = $1 AND status = $2
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(transaction_id)
        .bind(expected.as_str())
        .bind(status.as_str())
        .bind(failure_reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("update transaction status", e))?;

        timer.observe_duration();
        Ok(transaction)
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn fail_pending_charge(
        &self,
        transaction_id: Uuid,
        failure_reason: &str,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["fail_pending_charge"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin pending failure", e))?;

        let transaction = sqlx::query_as::<_, PaymentTransaction>(&format!(
            r#"
            UPDATE payment_transactions
            SET status = $2, failure_reason = $3, updated_at = NOW()
            WHERE transaction_id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(transaction_id)
        .bind(TransactionStatus::Failed.as_str())
        .bind(failure_reason)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("fail pending charge", e))?;

        let Some(transaction) = transaction else {
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2, updated_at = NOW()
            WHERE subscription_id = $1 AND status = 'active'
            "#,
        )
        .bind(transaction.subscription_id)
        .bind(SubscriptionStatus::PastDue.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("mark subscription past due", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("commit pending failure", e))?;

        timer.observe_duration();
        Ok(Some(transaction))
    }

    #[instrument(skip(self, refund), fields(original_id = %original_id, amount = refund.amount))]
    async fn record_refund(
        &self,
        original_id: Uuid,
        refund: &NewTransaction,
    ) -> Result<PaymentTransaction, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_refund"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin refund", e))?;

        let marked = sqlx::query(
            r#"
            UPDATE payment_transactions
            SET status = $2, updated_at = NOW()
            WHERE transaction_id = $1 AND status = 'succeeded'
            "#,
        )
        .bind(original_id)
        .bind(TransactionStatus::Refunded.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("mark transaction refunded", e))?;

        if marked.rows_affected() == 0 {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Transaction {} is not a succeeded charge",
                original_id
            )));
        }

        let transaction = Self::insert_transaction(&mut tx, refund).await?;

        tx.commit()
            .await
            .map_err(|e| db_error("commit refund", e))?;

        timer.observe_duration();
        Ok(transaction)
    }
}
