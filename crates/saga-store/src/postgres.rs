use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    ApplyOutcome, BusinessKey, DeadLetter, DeadLetterKind, DeadLetterQuery, MessageId,
    OutboxMessage, OutboxStatus, Result, SagaRecord, StoreError, TransitionLogEntry,
    TransitionWrite, Version,
    store::{SagaStore, validate_transition_write},
};

const OUTBOX_COLUMNS: &str = "id, saga_type, correlation_id, saga_version, command_type, topic, \
     payload, idempotency_key, is_compensation, status, attempts, last_error, created_at, dispatched_at";

const DEAD_LETTER_COLUMNS: &str =
    "id, kind, saga_type, correlation_id, event_type, payload, error, recorded_at";

/// PostgreSQL-backed saga store implementation.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_record(row: PgRow) -> Result<SagaRecord> {
        Ok(SagaRecord {
            saga_type: row.try_get("saga_type")?,
            correlation_id: BusinessKey::new(row.try_get::<String, _>("correlation_id")?),
            state: row.try_get("state")?,
            version: Version::new(row.try_get("version")?),
            data: row.try_get("data")?,
            is_completed: row.try_get("is_completed")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_log_entry(row: PgRow) -> Result<TransitionLogEntry> {
        Ok(TransitionLogEntry {
            saga_type: row.try_get("saga_type")?,
            correlation_id: BusinessKey::new(row.try_get::<String, _>("correlation_id")?),
            version: Version::new(row.try_get("version")?),
            event_type: row.try_get("event_type")?,
            from_state: row.try_get("from_state")?,
            to_state: row.try_get("to_state")?,
            message_id: row
                .try_get::<Option<Uuid>, _>("message_id")?
                .map(MessageId::from_uuid),
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxMessage> {
        let status: String = row.try_get("status")?;
        let status = OutboxStatus::parse(&status).ok_or_else(|| StoreError::CorruptRow {
            table: "saga_outbox",
            reason: format!("unknown status '{status}'"),
        })?;
        let attempts: i32 = row.try_get("attempts")?;

        Ok(OutboxMessage {
            id: MessageId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_type: row.try_get("saga_type")?,
            correlation_id: BusinessKey::new(row.try_get::<String, _>("correlation_id")?),
            saga_version: Version::new(row.try_get("saga_version")?),
            command_type: row.try_get("command_type")?,
            topic: row.try_get("topic")?,
            payload: row.try_get("payload")?,
            idempotency_key: row.try_get("idempotency_key")?,
            is_compensation: row.try_get("is_compensation")?,
            status,
            attempts: u32::try_from(attempts).unwrap_or_default(),
            last_error: row.try_get("last_error")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            dispatched_at: row.try_get("dispatched_at")?,
        })
    }

    fn row_to_dead_letter(row: PgRow) -> Result<DeadLetter> {
        let kind: String = row.try_get("kind")?;
        let kind = DeadLetterKind::parse(&kind).ok_or_else(|| StoreError::CorruptRow {
            table: "saga_dead_letters",
            reason: format!("unknown kind '{kind}'"),
        })?;

        Ok(DeadLetter {
            id: MessageId::from_uuid(row.try_get::<Uuid, _>("id")?),
            kind,
            saga_type: row.try_get("saga_type")?,
            correlation_id: row
                .try_get::<Option<String>, _>("correlation_id")?
                .map(BusinessKey::new),
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            error: row.try_get("error")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    async fn current_version(&self, saga_type: &str, correlation_id: &BusinessKey) -> Result<Version> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM saga_instances WHERE saga_type = $1 AND correlation_id = $2",
        )
        .bind(saga_type)
        .bind(correlation_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(version.map(Version::new).unwrap_or(Version::initial()))
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn load(
        &self,
        saga_type: &str,
        correlation_id: &BusinessKey,
    ) -> Result<Option<SagaRecord>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT saga_type, correlation_id, state, version, data, is_completed, created_at, updated_at
            FROM saga_instances
            WHERE saga_type = $1 AND correlation_id = $2
            "#,
        )
        .bind(saga_type)
        .bind(correlation_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    async fn try_apply_transition(&self, write: TransitionWrite) -> Result<ApplyOutcome> {
        validate_transition_write(&write)?;

        let new_version = write.new_version();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        // Conditional write: insert when the instance must not exist yet,
        // otherwise update only at the version the writer read
        let result = if write.expected_version.is_initial() {
            sqlx::query(
                r#"
                INSERT INTO saga_instances
                    (saga_type, correlation_id, state, version, data, is_completed, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
                ON CONFLICT (saga_type, correlation_id) DO NOTHING
                "#,
            )
            .bind(&write.saga_type)
            .bind(write.correlation_id.as_str())
            .bind(&write.new_state)
            .bind(new_version.as_i64())
            .bind(&write.data)
            .bind(write.is_completed)
            .bind(now)
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE saga_instances
                SET state = $3, version = $4, data = $5, is_completed = $6, updated_at = $7
                WHERE saga_type = $1 AND correlation_id = $2 AND version = $8
                "#,
            )
            .bind(&write.saga_type)
            .bind(write.correlation_id.as_str())
            .bind(&write.new_state)
            .bind(new_version.as_i64())
            .bind(&write.data)
            .bind(write.is_completed)
            .bind(now)
            .bind(write.expected_version.as_i64())
            .execute(&mut *tx)
            .await?
        };

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            let actual = self
                .current_version(&write.saga_type, &write.correlation_id)
                .await?;
            tracing::debug!(
                saga_type = %write.saga_type,
                correlation_id = %write.correlation_id,
                expected = %write.expected_version,
                actual = %actual,
                "version conflict"
            );
            return Ok(ApplyOutcome::VersionConflict {
                expected: write.expected_version,
                actual,
            });
        }

        let entry = write.log_entry(now);
        sqlx::query(
            r#"
            INSERT INTO saga_transitions
                (saga_type, correlation_id, version, event_type, from_state, to_state, message_id, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&entry.saga_type)
        .bind(entry.correlation_id.as_str())
        .bind(entry.version.as_i64())
        .bind(&entry.event_type)
        .bind(&entry.from_state)
        .bind(&entry.to_state)
        .bind(entry.message_id.map(|id| id.as_uuid()))
        .bind(entry.recorded_at)
        .execute(&mut *tx)
        .await?;

        for message in &write.outbox {
            sqlx::query(
                r#"
                INSERT INTO saga_outbox
                    (id, saga_type, correlation_id, saga_version, command_type, topic, payload,
                     idempotency_key, is_compensation, status, attempts, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, $11)
                ON CONFLICT (idempotency_key) DO NOTHING
                "#,
            )
            .bind(message.id.as_uuid())
            .bind(&message.saga_type)
            .bind(message.correlation_id.as_str())
            .bind(message.saga_version.as_i64())
            .bind(&message.command_type)
            .bind(&message.topic)
            .bind(&message.payload)
            .bind(&message.idempotency_key)
            .bind(message.is_compensation)
            .bind(OutboxStatus::Pending.as_str())
            .bind(message.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(ApplyOutcome::Applied {
            version: new_version,
        })
    }

    async fn transition_log(
        &self,
        saga_type: &str,
        correlation_id: &BusinessKey,
    ) -> Result<Vec<TransitionLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT saga_type, correlation_id, version, event_type, from_state, to_state, message_id, recorded_at
            FROM saga_transitions
            WHERE saga_type = $1 AND correlation_id = $2
            ORDER BY version ASC
            "#,
        )
        .bind(saga_type)
        .bind(correlation_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_log_entry).collect()
    }

    async fn outbox_for(
        &self,
        saga_type: &str,
        correlation_id: &BusinessKey,
    ) -> Result<Vec<OutboxMessage>> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM saga_outbox \
             WHERE saga_type = $1 AND correlation_id = $2 ORDER BY seq ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(saga_type)
            .bind(correlation_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM saga_outbox \
             WHERE status = $1 ORDER BY seq ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(OutboxStatus::Pending.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn mark_dispatched(&self, id: MessageId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE saga_outbox SET status = $2, dispatched_at = $3 WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(OutboxStatus::Dispatched.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::OutboxMessageNotFound(id));
        }
        Ok(())
    }

    async fn record_dispatch_failure(
        &self,
        id: MessageId,
        error: &str,
        give_up: bool,
    ) -> Result<OutboxMessage> {
        let sql = format!(
            "UPDATE saga_outbox \
             SET attempts = attempts + 1, last_error = $2, \
                 status = CASE WHEN $3 THEN $4 ELSE status END \
             WHERE id = $1 RETURNING {OUTBOX_COLUMNS}"
        );
        let row: Option<PgRow> = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(error)
            .bind(give_up)
            .bind(OutboxStatus::Failed.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::row_to_outbox(row),
            None => Err(StoreError::OutboxMessageNotFound(id)),
        }
    }

    async fn record_dead_letter(&self, letter: DeadLetter) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_dead_letters
                (id, kind, saga_type, correlation_id, event_type, payload, error, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(letter.id.as_uuid())
        .bind(letter.kind.as_str())
        .bind(&letter.saga_type)
        .bind(letter.correlation_id.as_ref().map(|k| k.as_str()))
        .bind(&letter.event_type)
        .bind(&letter.payload)
        .bind(&letter.error)
        .bind(letter.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn dead_letters(&self, query: DeadLetterQuery) -> Result<Vec<DeadLetter>> {
        let mut sql = format!("SELECT {DEAD_LETTER_COLUMNS} FROM saga_dead_letters WHERE 1=1");
        let mut param_count = 0;

        // Build dynamic query
        if query.kind.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND kind = ${param_count}"));
        }
        if query.saga_type.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND saga_type = ${param_count}"));
        }
        if query.correlation_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND correlation_id = ${param_count}"));
        }
        if query.operator_only {
            param_count += 1;
            sql.push_str(&format!(" AND kind = ANY(${param_count})"));
        }
        if query.from_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND recorded_at >= ${param_count}"));
        }

        sql.push_str(" ORDER BY recorded_at ASC, seq ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(kind) = query.kind {
            sqlx_query = sqlx_query.bind(kind.as_str());
        }
        if let Some(saga_type) = query.saga_type {
            sqlx_query = sqlx_query.bind(saga_type);
        }
        if let Some(key) = query.correlation_id {
            sqlx_query = sqlx_query.bind(key.as_str().to_string());
        }
        if query.operator_only {
            let kinds: Vec<String> = [
                DeadLetterKind::DataConflict,
                DeadLetterKind::TransientPersistenceFailure,
                DeadLetterKind::CompensationFailure,
            ]
            .iter()
            .map(|k| k.as_str().to_string())
            .collect();
            sqlx_query = sqlx_query.bind(kinds);
        }
        if let Some(from_ts) = query.from_timestamp {
            sqlx_query = sqlx_query.bind(from_ts);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_dead_letter).collect()
    }
}
