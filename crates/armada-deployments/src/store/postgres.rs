//! PostgreSQL deployment store implementation.
//!
//! Deployment headers keep one integer column per status counter, so a
//! counter transition is a single conditional `UPDATE` and phase filters are
//! plain column predicates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

use crate::config::DatabaseConfig;
use crate::deployment::Deployment;
use crate::device_deployment::{DeploymentLog, DeviceDeployment, Image, LogMessage};
use crate::error::{DeploymentError, DeploymentResult};
use crate::query::Query;
use crate::stats::Stats;
use crate::status::DeviceDeploymentStatus;
use crate::types::{DeploymentId, DeviceDeploymentId, DeviceId, ImageId};

use super::{DeploymentLogStore, DeploymentStore, DeviceDeploymentStore};

const TEXT_INDEX: &str = "idx_deployments_text";

/// Expression the text index is built on; `find` must use it verbatim.
const TEXT_TERMS: &str = "regexp_split_to_array(lower(name || ' ' || artifact_name), '[^[:alnum:]]+')";

const DEVICE_DEPLOYMENT_COLUMNS: &str = "id, deployment_id, device_id, status, created, finished, \
     device_type, image, is_log_available";

/// PostgreSQL-backed store implementing every storage trait.
pub struct PostgresStore {
    pool: PgPool,
    text_index: AtomicBool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(url: &str) -> DeploymentResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Connect using pool settings from configuration.
    pub async fn connect(config: &DatabaseConfig) -> DeploymentResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        Self::from_pool(pool).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> DeploymentResult<Self> {
        let store = Self {
            pool,
            text_index: AtomicBool::new(false),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required tables and lookup indexes exist.
    ///
    /// The free-text index is separate, see [`Self::ensure_text_index`].
    async fn ensure_schema(&self) -> DeploymentResult<()> {
        let counters: Vec<String> = DeviceDeploymentStatus::ALL
            .iter()
            .map(|s| format!("{0} BIGINT NOT NULL DEFAULT 0 CHECK ({0} >= 0)", s.column()))
            .collect();

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                artifact_name TEXT NOT NULL,
                created TIMESTAMPTZ NOT NULL,
                finished TIMESTAMPTZ,
                device_count BIGINT NOT NULL,
                {}
            )
            "#,
            counters.join(",\n                ")
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_created
            ON deployments (created DESC, id DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS device_deployments (
                id TEXT PRIMARY KEY,
                deployment_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created TIMESTAMPTZ NOT NULL,
                finished TIMESTAMPTZ,
                device_type TEXT NOT NULL,
                image JSONB,
                image_id TEXT,
                is_log_available BOOLEAN NOT NULL DEFAULT FALSE,
                UNIQUE (deployment_id, device_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_device_deployments_device_status
            ON device_deployments (device_id, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_device_deployments_image
            ON device_deployments (image_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS device_deployment_logs (
                deployment_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                messages JSONB NOT NULL,
                PRIMARY KEY (deployment_id, device_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Create the free-text index over name and artifact name.
    pub async fn ensure_text_index(&self) -> DeploymentResult<()> {
        if self.text_index.load(Ordering::Acquire) {
            return Ok(());
        }

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {TEXT_INDEX} ON deployments USING GIN (({TEXT_TERMS}))"
        ))
        .execute(&self.pool)
        .await?;

        self.text_index.store(true, Ordering::Release);
        Ok(())
    }

    async fn has_text_index(&self) -> DeploymentResult<bool> {
        if self.text_index.load(Ordering::Acquire) {
            return Ok(true);
        }

        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM pg_indexes
                WHERE tablename = 'deployments' AND indexname = $1
            )
            "#,
        )
        .bind(TEXT_INDEX)
        .fetch_one(&self.pool)
        .await?;

        if exists {
            self.text_index.store(true, Ordering::Release);
        }
        Ok(exists)
    }

    async fn deployment_exists(&self, id: &DeploymentId) -> DeploymentResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM deployments WHERE id = $1)")
                .bind(id.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    fn select_deployments() -> String {
        let counters: Vec<&str> = DeviceDeploymentStatus::ALL
            .iter()
            .map(DeviceDeploymentStatus::column)
            .collect();
        format!(
            "SELECT id, name, artifact_name, created, finished, device_count, {} FROM deployments",
            counters.join(", ")
        )
    }

    /// Parse a row into a Deployment.
    fn row_to_deployment(row: &PgRow) -> DeploymentResult<Deployment> {
        let mut stats = Stats::new();
        for status in DeviceDeploymentStatus::ALL {
            let count: i64 = row.get(status.column());
            stats.set(status, to_count(count)?);
        }
        let device_count: i64 = row.get("device_count");

        Ok(Deployment {
            id: DeploymentId::new(row.get::<String, _>("id")),
            name: row.get("name"),
            artifact_name: row.get("artifact_name"),
            created: row.get("created"),
            finished: row.get("finished"),
            device_count: to_count(device_count)?,
            stats,
        })
    }

    /// Parse a row into a DeviceDeployment.
    fn row_to_device_deployment(row: &PgRow) -> DeploymentResult<DeviceDeployment> {
        let status: String = row.get("status");
        let image: Option<serde_json::Value> = row.get("image");

        let image = image
            .map(serde_json::from_value::<Image>)
            .transpose()
            .map_err(|e| {
                DeploymentError::Serialisation(format!("failed to deserialise image: {e}"))
            })?;

        Ok(DeviceDeployment {
            id: DeviceDeploymentId::new(row.get::<String, _>("id")),
            deployment_id: DeploymentId::new(row.get::<String, _>("deployment_id")),
            device_id: DeviceId::new(row.get::<String, _>("device_id")),
            status: parse_status(&status)?,
            created: row.get("created"),
            finished: row.get("finished"),
            device_type: row.get("device_type"),
            image,
            is_log_available: row.get("is_log_available"),
        })
    }
}

fn to_count(value: i64) -> DeploymentResult<u64> {
    u64::try_from(value)
        .map_err(|_| DeploymentError::Serialisation(format!("negative counter value {value}")))
}

fn to_column(value: u64) -> DeploymentResult<i64> {
    i64::try_from(value)
        .map_err(|_| DeploymentError::Serialisation(format!("counter value {value} too large")))
}

fn parse_status(value: &str) -> DeploymentResult<DeviceDeploymentStatus> {
    value.parse().map_err(|e| {
        DeploymentError::Serialisation(format!("failed to parse status '{value}': {e}"))
    })
}

fn status_names(statuses: &[DeviceDeploymentStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_owned()).collect()
}

#[async_trait]
impl DeploymentStore for PostgresStore {
    async fn insert(&self, deployment: &Deployment) -> DeploymentResult<()> {
        deployment.id.validate()?;
        self.ensure_text_index().await?;

        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO deployments (id, name, artifact_name, created, finished, device_count",
        );
        for status in DeviceDeploymentStatus::ALL {
            builder.push(", ").push(status.column());
        }
        builder.push(") VALUES (");
        {
            let mut values = builder.separated(", ");
            values.push_bind(deployment.id.as_str());
            values.push_bind(&deployment.name);
            values.push_bind(&deployment.artifact_name);
            values.push_bind(deployment.created);
            values.push_bind(deployment.finished);
            values.push_bind(to_column(deployment.device_count)?);
            for (_, count) in deployment.stats.iter() {
                values.push_bind(to_column(count)?);
            }
        }
        builder.push(")");

        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn delete(&self, id: &DeploymentId) -> DeploymentResult<()> {
        id.validate()?;
        let result = sqlx::query("DELETE FROM deployments WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DeploymentError::DeploymentNotFound(id.to_string()));
        }

        Ok(())
    }

    async fn find_by_id(&self, id: &DeploymentId) -> DeploymentResult<Option<Deployment>> {
        id.validate()?;
        let row = sqlx::query(&format!("{} WHERE id = $1", Self::select_deployments()))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_deployment).transpose()
    }

    async fn find_unfinished_by_id(
        &self,
        id: &DeploymentId,
    ) -> DeploymentResult<Option<Deployment>> {
        id.validate()?;
        let row = sqlx::query(&format!(
            "{} WHERE id = $1 AND finished IS NULL",
            Self::select_deployments()
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_deployment).transpose()
    }

    async fn update_stats(
        &self,
        id: &DeploymentId,
        from: DeviceDeploymentStatus,
        to: DeviceDeploymentStatus,
    ) -> DeploymentResult<()> {
        id.validate()?;

        if from == to {
            if self.deployment_exists(id).await? {
                return Ok(());
            }
            return Err(DeploymentError::MissingUpdateTarget(id.to_string()));
        }

        let (from_col, to_col) = (from.column(), to.column());
        let result = sqlx::query(&format!(
            r#"
            UPDATE deployments
            SET {from_col} = {from_col} - 1, {to_col} = {to_col} + 1
            WHERE id = $1 AND {from_col} > 0
            "#
        ))
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if self.deployment_exists(id).await? {
                return Err(DeploymentError::NegativeCounter {
                    deployment_id: id.to_string(),
                    status: from,
                });
            }
            return Err(DeploymentError::MissingUpdateTarget(id.to_string()));
        }

        Ok(())
    }

    async fn update_stats_and_finish(
        &self,
        id: &DeploymentId,
        stats: Stats,
    ) -> DeploymentResult<()> {
        id.validate()?;

        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new("UPDATE deployments SET ");
        for (idx, (status, count)) in stats.iter().enumerate() {
            if idx > 0 {
                builder.push(", ");
            }
            builder.push(status.column()).push(" = ");
            builder.push_bind(to_column(count)?);
        }
        builder.push(", finished = CASE WHEN ");
        builder.push_bind(stats.is_finished());
        builder.push(" THEN COALESCE(finished, NOW()) ELSE finished END WHERE id = ");
        builder.push_bind(id.as_str());

        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(DeploymentError::MissingUpdateTarget(id.to_string()));
        }

        Ok(())
    }

    async fn find(&self, query: &Query) -> DeploymentResult<Vec<Deployment>> {
        query.validate()?;
        let terms = query.terms();
        if terms.is_some() && !self.has_text_index().await? {
            return Err(DeploymentError::MissingTextIndex);
        }

        let select = Self::select_deployments();
        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(select);
        builder.push(" WHERE ");
        builder.push(query.phase.predicate().to_sql());

        if let Some(after) = query.created_after {
            builder.push(" AND created >= ").push_bind(after);
        }
        if let Some(before) = query.created_before {
            builder.push(" AND created <= ").push_bind(before);
        }
        match terms {
            Some(terms) if terms.is_empty() => {
                builder.push(" AND FALSE");
            }
            Some(terms) => {
                builder
                    .push(format!(" AND {TEXT_TERMS} && "))
                    .push_bind(terms)
                    .push("::text[]");
            }
            None => {}
        }

        builder.push(" ORDER BY created DESC, id DESC");

        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(to_column(limit)?);
        }
        builder.push(" OFFSET ").push_bind(to_column(query.skip)?);

        let rows = builder.build().fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_deployment).collect()
    }

    async fn finish(&self, id: &DeploymentId, when: DateTime<Utc>) -> DeploymentResult<()> {
        id.validate()?;
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET finished = COALESCE(finished, $2)
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(when)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DeploymentError::MissingUpdateTarget(id.to_string()));
        }

        Ok(())
    }
}

#[async_trait]
impl DeviceDeploymentStore for PostgresStore {
    async fn insert_many(&self, records: &[DeviceDeployment]) -> DeploymentResult<()> {
        let mut tx = self.pool.begin().await?;

        for record in records {
            record.deployment_id.validate()?;
            record.device_id.validate()?;

            let image = record
                .image
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| {
                    DeploymentError::Serialisation(format!("failed to serialise image: {e}"))
                })?;

            sqlx::query(
                r#"
                INSERT INTO device_deployments (
                    id, deployment_id, device_id, status, created, finished,
                    device_type, image, image_id, is_log_available
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(record.id.as_str())
            .bind(record.deployment_id.as_str())
            .bind(record.device_id.as_str())
            .bind(record.status.as_str())
            .bind(record.created)
            .bind(record.finished)
            .bind(&record.device_type)
            .bind(image)
            .bind(record.image.as_ref().map(|i| i.id.as_str()))
            .bind(record.is_log_available)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn exist_assigned_image_with_id_and_statuses(
        &self,
        image_id: &ImageId,
        statuses: &[DeviceDeploymentStatus],
    ) -> DeploymentResult<bool> {
        image_id.validate()?;
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM device_deployments
                WHERE image_id = $1
                  AND (cardinality($2::text[]) = 0 OR status = ANY($2))
            )
            "#,
        )
        .bind(image_id.as_str())
        .bind(status_names(statuses))
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn find_oldest_for_device_with_statuses(
        &self,
        device_id: &DeviceId,
        statuses: &[DeviceDeploymentStatus],
    ) -> DeploymentResult<Option<DeviceDeployment>> {
        device_id.validate()?;
        let row = sqlx::query(&format!(
            r#"
            SELECT {DEVICE_DEPLOYMENT_COLUMNS} FROM device_deployments
            WHERE device_id = $1
              AND (cardinality($2::text[]) = 0 OR status = ANY($2))
            ORDER BY created ASC, id ASC
            LIMIT 1
            "#
        ))
        .bind(device_id.as_str())
        .bind(status_names(statuses))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_device_deployment).transpose()
    }

    async fn find_all_for_device_with_statuses(
        &self,
        device_id: &DeviceId,
        statuses: &[DeviceDeploymentStatus],
    ) -> DeploymentResult<Vec<DeviceDeployment>> {
        device_id.validate()?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DEVICE_DEPLOYMENT_COLUMNS} FROM device_deployments
            WHERE device_id = $1
              AND (cardinality($2::text[]) = 0 OR status = ANY($2))
            ORDER BY created ASC, id ASC
            "#
        ))
        .bind(device_id.as_str())
        .bind(status_names(statuses))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_device_deployment).collect()
    }

    async fn update_status(
        &self,
        device_id: &DeviceId,
        deployment_id: &DeploymentId,
        status: DeviceDeploymentStatus,
        finished: Option<DateTime<Utc>>,
    ) -> DeploymentResult<DeviceDeploymentStatus> {
        device_id.validate()?;
        deployment_id.validate()?;

        let previous: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE device_deployments AS d
            SET status = $3, finished = $4
            FROM (
                SELECT id, status FROM device_deployments
                WHERE deployment_id = $1 AND device_id = $2
                FOR UPDATE
            ) AS prev
            WHERE d.id = prev.id
              AND prev.status = ANY($5)
            RETURNING prev.status
            "#,
        )
        .bind(deployment_id.as_str())
        .bind(device_id.as_str())
        .bind(status.as_str())
        .bind(finished)
        .bind(status_names(&DeviceDeploymentStatus::ACTIVE))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(previous) = previous {
            return parse_status(&previous);
        }

        match self.get_status(deployment_id, device_id).await? {
            None => Err(DeploymentError::DeviceDeploymentNotFound {
                deployment_id: deployment_id.to_string(),
                device_id: device_id.to_string(),
            }),
            Some(DeviceDeploymentStatus::Aborted) => Err(DeploymentError::DeploymentAborted),
            Some(DeviceDeploymentStatus::Decommissioned) => {
                Err(DeploymentError::DeviceDecommissioned)
            }
            Some(current) if current == status => Ok(current),
            Some(current) => Err(DeploymentError::InvalidStatusTransition {
                from: current,
                to: status,
            }),
        }
    }

    async fn get_status(
        &self,
        deployment_id: &DeploymentId,
        device_id: &DeviceId,
    ) -> DeploymentResult<Option<DeviceDeploymentStatus>> {
        deployment_id.validate()?;
        device_id.validate()?;
        let status: Option<String> = sqlx::query_scalar(
            r#"
            SELECT status FROM device_deployments
            WHERE deployment_id = $1 AND device_id = $2
            "#,
        )
        .bind(deployment_id.as_str())
        .bind(device_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        status.as_deref().map(parse_status).transpose()
    }

    async fn update_log_availability(
        &self,
        device_id: &DeviceId,
        deployment_id: &DeploymentId,
        available: bool,
    ) -> DeploymentResult<()> {
        device_id.validate()?;
        deployment_id.validate()?;
        let result = sqlx::query(
            r#"
            UPDATE device_deployments
            SET is_log_available = $3
            WHERE deployment_id = $1 AND device_id = $2
            "#,
        )
        .bind(deployment_id.as_str())
        .bind(device_id.as_str())
        .bind(available)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DeploymentError::DeviceDeploymentNotFound {
                deployment_id: deployment_id.to_string(),
                device_id: device_id.to_string(),
            });
        }

        Ok(())
    }

    async fn aggregate_by_status(&self, deployment_id: &DeploymentId) -> DeploymentResult<Stats> {
        deployment_id.validate()?;
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM device_deployments
            WHERE deployment_id = $1
            GROUP BY status
            "#,
        )
        .bind(deployment_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut stats = Stats::new();
        for row in &rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            stats.set(parse_status(&status)?, to_count(count)?);
        }
        Ok(stats)
    }

    async fn get_device_statuses_for_deployment(
        &self,
        deployment_id: &DeploymentId,
    ) -> DeploymentResult<Vec<DeviceDeployment>> {
        deployment_id.validate()?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DEVICE_DEPLOYMENT_COLUMNS} FROM device_deployments
            WHERE deployment_id = $1
            ORDER BY device_id
            "#
        ))
        .bind(deployment_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_device_deployment).collect()
    }

    async fn has_deployment_for_device(
        &self,
        deployment_id: &DeploymentId,
        device_id: &DeviceId,
    ) -> DeploymentResult<bool> {
        deployment_id.validate()?;
        device_id.validate()?;
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM device_deployments
                WHERE deployment_id = $1 AND device_id = $2
            )
            "#,
        )
        .bind(deployment_id.as_str())
        .bind(device_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn abort_device_deployments(&self, deployment_id: &DeploymentId) -> DeploymentResult<u64> {
        deployment_id.validate()?;
        let result = sqlx::query(
            r#"
            UPDATE device_deployments
            SET status = 'aborted', finished = NOW()
            WHERE deployment_id = $1 AND status = ANY($2)
            "#,
        )
        .bind(deployment_id.as_str())
        .bind(status_names(&DeviceDeploymentStatus::ACTIVE))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn decommission_device_deployments(&self, device_id: &DeviceId) -> DeploymentResult<u64> {
        device_id.validate()?;
        let result = sqlx::query(
            r#"
            UPDATE device_deployments
            SET status = 'decommissioned', finished = NOW()
            WHERE device_id = $1 AND status = ANY($2)
            "#,
        )
        .bind(device_id.as_str())
        .bind(status_names(&DeviceDeploymentStatus::ACTIVE))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_by_deployment(&self, deployment_id: &DeploymentId) -> DeploymentResult<u64> {
        deployment_id.validate()?;
        let result = sqlx::query("DELETE FROM device_deployments WHERE deployment_id = $1")
            .bind(deployment_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DeploymentLogStore for PostgresStore {
    async fn save_log(&self, log: &DeploymentLog) -> DeploymentResult<()> {
        log.deployment_id.validate()?;
        log.device_id.validate()?;

        let messages = serde_json::to_value(&log.messages).map_err(|e| {
            DeploymentError::Serialisation(format!("failed to serialise log messages: {e}"))
        })?;

        sqlx::query(
            r#"
            INSERT INTO device_deployment_logs (deployment_id, device_id, messages)
            VALUES ($1, $2, $3)
            ON CONFLICT (deployment_id, device_id) DO UPDATE
            SET messages = EXCLUDED.messages
            "#,
        )
        .bind(log.deployment_id.as_str())
        .bind(log.device_id.as_str())
        .bind(&messages)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_log(
        &self,
        deployment_id: &DeploymentId,
        device_id: &DeviceId,
    ) -> DeploymentResult<Option<DeploymentLog>> {
        deployment_id.validate()?;
        device_id.validate()?;
        let messages: Option<serde_json::Value> = sqlx::query_scalar(
            r#"
            SELECT messages FROM device_deployment_logs
            WHERE deployment_id = $1 AND device_id = $2
            "#,
        )
        .bind(deployment_id.as_str())
        .bind(device_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(messages) = messages else {
            return Ok(None);
        };

        let messages: Vec<LogMessage> = serde_json::from_value(messages).map_err(|e| {
            DeploymentError::Serialisation(format!("failed to deserialise log messages: {e}"))
        })?;

        Ok(Some(DeploymentLog {
            deployment_id: deployment_id.clone(),
            device_id: device_id.clone(),
            messages,
        }))
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::DeploymentConstructor;
    use crate::query::PhaseFilter;
    use crate::status::DeviceDeploymentStatus as S;

    fn get_database_url() -> Option<String> {
        std::env::var("DATABASE_URL").ok()
    }

    fn test_deployment(devices: usize) -> Deployment {
        let devices = (0..devices).map(|i| DeviceId::new(format!("pg-dev-{i}")));
        Deployment::from_constructor(
            &DeploymentConstructor::new("postgres rollout", "App-2.0", devices),
            Utc::now(),
        )
    }

    fn test_record(deployment: &Deployment, device: &str) -> DeviceDeployment {
        DeviceDeployment::pending(
            deployment.id.clone(),
            DeviceId::new(device),
            "rpi4",
            Image {
                id: ImageId::new(format!("img-{}", deployment.id)),
                artifact_name: deployment.artifact_name.clone(),
                device_types_compatible: vec!["rpi4".to_owned()],
            },
            deployment.created,
        )
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn insert_and_find_by_id() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url).await.expect("failed to connect");

        let deployment = test_deployment(3);
        store.insert(&deployment).await.expect("insert failed");

        let retrieved = store
            .find_by_id(&deployment.id)
            .await
            .expect("get failed")
            .expect("deployment not found");
        assert_eq!(retrieved.name, deployment.name);
        assert_eq!(retrieved.stats, deployment.stats);
        assert_eq!(retrieved.device_count, 3);

        store.delete(&deployment.id).await.expect("delete failed");
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn update_stats_is_conditional() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url).await.expect("failed to connect");

        let deployment = test_deployment(1);
        store.insert(&deployment).await.expect("insert failed");

        store
            .update_stats(&deployment.id, S::Pending, S::Downloading)
            .await
            .expect("update failed");

        let err = store
            .update_stats(&deployment.id, S::Pending, S::Downloading)
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::NegativeCounter { .. }));

        let err = store
            .update_stats(&DeploymentId::generate(), S::Pending, S::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::MissingUpdateTarget(_)));

        store
            .update_stats_and_finish(&deployment.id, Stats::new().with(S::Success, 1))
            .await
            .expect("finish failed");
        let finished = store
            .find_by_id(&deployment.id)
            .await
            .expect("get failed")
            .expect("not found");
        assert!(finished.finished.is_some());

        store.delete(&deployment.id).await.expect("delete failed");
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn find_with_phase_and_text() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url).await.expect("failed to connect");

        let deployment = test_deployment(2);
        store.insert(&deployment).await.expect("insert failed");

        let pending = store
            .find(
                &Query::new()
                    .with_phase(PhaseFilter::Pending)
                    .with_search_text("postgres"),
            )
            .await
            .expect("find failed");
        assert!(pending.iter().any(|d| d.id == deployment.id));

        let finished = store
            .find(&Query::new().with_phase(PhaseFilter::Finished))
            .await
            .expect("find failed");
        assert!(finished.iter().all(|d| d.id != deployment.id));

        store.delete(&deployment.id).await.expect("delete failed");
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn device_status_updates() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url).await.expect("failed to connect");

        let deployment = test_deployment(1);
        let record = test_record(&deployment, "pg-dev-0");
        store
            .insert_many(std::slice::from_ref(&record))
            .await
            .expect("insert failed");

        let previous = store
            .update_status(&record.device_id, &deployment.id, S::Downloading, None)
            .await
            .expect("update failed");
        assert_eq!(previous, S::Pending);

        assert_eq!(
            store
                .abort_device_deployments(&deployment.id)
                .await
                .expect("abort failed"),
            1
        );
        let err = store
            .update_status(&record.device_id, &deployment.id, S::Installing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeploymentError::DeploymentAborted));

        let stats = store
            .aggregate_by_status(&deployment.id)
            .await
            .expect("aggregate failed");
        assert_eq!(stats.get(S::Aborted), 1);

        store
            .delete_by_deployment(&deployment.id)
            .await
            .expect("delete failed");
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn terminal_status_is_not_overwritten() {
        let url = get_database_url().expect("DATABASE_URL not set");
        let store = PostgresStore::new(&url).await.expect("failed to connect");

        let deployment = test_deployment(1);
        let record = test_record(&deployment, "pg-dev-final");
        store
            .insert_many(std::slice::from_ref(&record))
            .await
            .expect("insert failed");

        store
            .update_status(&record.device_id, &deployment.id, S::Success, Some(Utc::now()))
            .await
            .expect("update failed");

        let err = store
            .update_status(&record.device_id, &deployment.id, S::Failure, Some(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeploymentError::InvalidStatusTransition {
                from: S::Success,
                to: S::Failure
            }
        ));

        let again = store
            .update_status(&record.device_id, &deployment.id, S::Success, Some(Utc::now()))
            .await
            .expect("repeating the final status should succeed");
        assert_eq!(again, S::Success);
        assert_eq!(
            store
                .get_status(&deployment.id, &record.device_id)
                .await
                .expect("status lookup failed"),
            Some(S::Success)
        );

        store
            .delete_by_deployment(&deployment.id)
            .await
            .expect("delete failed");
    }
}
