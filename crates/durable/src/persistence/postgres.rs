//! PostgreSQL implementation of WorkflowEventStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency control via sequence numbers
//! - Claiming with `FOR UPDATE SKIP LOCKED`
//! - One transaction per commit batch (events, queue rows and indexes)

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::store::*;
use crate::task::TaskError;
use crate::workflow::{EventEnvelope, ParseStatusError, WorkflowEvent, WorkflowStatus};

/// Placeholder parent used so top-level keys share the unique index
const NO_PARENT: Uuid = Uuid::nil();

/// PostgreSQL implementation of WorkflowEventStore
///
/// # Example
///
/// ```ignore
/// use ledgerflow_durable::PostgresWorkflowEventStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresWorkflowEventStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowEventStore {
    pool: PgPool,
}

impl PostgresWorkflowEventStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    async fn execution_by_key(
        &self,
        parent_id: Option<Uuid>,
        key: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id FROM durable_workflow_executions
            WHERE COALESCE(parent_id, $1) = $2 AND idempotency_key = $3
            "#,
        )
        .bind(NO_PARENT)
        .bind(parent_id.unwrap_or(NO_PARENT))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("look up execution key", e))?;

        row.map(|r| r.try_get("id").map_err(decode_error))
            .transpose()
    }
}

/// Map a driver error into the store taxonomy
fn db_error(action: &str, e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => {
                StoreError::DuplicateKey(db.constraint().unwrap_or("unique").to_string())
            }
            // serialization_failure, deadlock_detected, admin shutdown
            Some("40001") | Some("40P01") | Some("57P01") => {
                warn!("Transient failure to {}: {}", action, e);
                StoreError::Unavailable(e.to_string())
            }
            _ => {
                error!("Failed to {}: {}", action, e);
                StoreError::Database(e.to_string())
            }
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            warn!("Transient failure to {}: {}", action, e);
            StoreError::Unavailable(e.to_string())
        }
        _ => {
            error!("Failed to {}: {}", action, e);
            StoreError::Database(e.to_string())
        }
    }
}

fn decode_error(e: sqlx::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn parse_status<T: std::str::FromStr<Err = ParseStatusError>>(
    value: &str,
) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|e: ParseStatusError| StoreError::Serialization(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn workflow_from_row(row: &PgRow) -> Result<WorkflowRecord, StoreError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    Ok(WorkflowRecord {
        id: row.try_get("id").map_err(decode_error)?,
        kind: row.try_get("kind").map_err(decode_error)?,
        version: row.try_get::<i32, _>("version").map_err(decode_error)? as u32,
        queue: row.try_get("queue").map_err(decode_error)?,
        status: parse_status(&status)?,
        parent_id: row.try_get("parent_id").map_err(decode_error)?,
        idempotency_key: row.try_get("idempotency_key").map_err(decode_error)?,
        input: row.try_get("input").map_err(decode_error)?,
        last_sequence: row.try_get("last_sequence").map_err(decode_error)?,
        claimed_by: row.try_get("claimed_by").map_err(decode_error)?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(decode_error)?,
        ready_at: row.try_get("ready_at").map_err(decode_error)?,
        parent_notify_pending: row.try_get("parent_notify_pending").map_err(decode_error)?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
    })
}

fn task_from_row(row: &PgRow) -> Result<TaskRecord, StoreError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let error: Option<serde_json::Value> = row.try_get("error").map_err(decode_error)?;
    Ok(TaskRecord {
        id: row.try_get("id").map_err(decode_error)?,
        workflow_id: row.try_get("workflow_id").map_err(decode_error)?,
        kind: row.try_get("kind").map_err(decode_error)?,
        queue: row.try_get("queue").map_err(decode_error)?,
        input: row.try_get("input").map_err(decode_error)?,
        idempotency_key: row.try_get("idempotency_key").map_err(decode_error)?,
        status: parse_status(&status)?,
        attempt: row.try_get::<i32, _>("attempt").map_err(decode_error)? as u32,
        max_retries: row.try_get::<i32, _>("max_retries").map_err(decode_error)? as u32,
        claimed_by: row.try_get("claimed_by").map_err(decode_error)?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(decode_error)?,
        visible_at: row.try_get("visible_at").map_err(decode_error)?,
        cancel_requested: row.try_get("cancel_requested").map_err(decode_error)?,
        output: row.try_get("output").map_err(decode_error)?,
        error: error
            .map(serde_json::from_value::<TaskError>)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
    })
}

async fn insert_event(
    conn: &mut PgConnection,
    workflow_id: Uuid,
    sequence: i64,
    event: &WorkflowEvent,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO durable_workflow_events (workflow_id, sequence, event_type, event_data, recorded_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(workflow_id)
    .bind(sequence)
    .bind(event.event_type())
    .bind(to_json(event)?)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| db_error("append event", e))?;
    Ok(())
}

async fn insert_execution(
    conn: &mut PgConnection,
    workflow: &NewWorkflow,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO durable_workflow_executions (
            id, kind, version, queue, status, parent_id, idempotency_key, input,
            last_sequence, ready_at, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, 1, $8, $8, $8)
        "#,
    )
    .bind(workflow.id)
    .bind(&workflow.kind)
    .bind(workflow.version as i32)
    .bind(&workflow.queue)
    .bind(workflow.parent_id)
    .bind(&workflow.idempotency_key)
    .bind(&workflow.input)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| db_error("create execution", e))?;

    insert_event(conn, workflow.id, 1, &workflow.started_event(), now).await
}

async fn insert_task(
    conn: &mut PgConnection,
    task: &NewTask,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO durable_tasks (
            id, workflow_id, kind, queue, input, idempotency_key, status,
            attempt, max_retries, visible_at, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7, $8, $8, $8)
        "#,
    )
    .bind(task.id)
    .bind(task.workflow_id)
    .bind(&task.kind)
    .bind(&task.queue)
    .bind(&task.input)
    .bind(&task.idempotency_key)
    .bind(task.max_retries as i32)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| db_error("enqueue task", e))?;
    Ok(())
}

#[async_trait]
impl WorkflowEventStore for PostgresWorkflowEventStore {
    #[instrument(skip(self, workflow), fields(kind = %workflow.kind))]
    async fn create_workflow(&self, workflow: NewWorkflow) -> Result<CreateOutcome, StoreError> {
        if let Some(key) = &workflow.idempotency_key {
            if let Some(existing) = self.execution_by_key(workflow.parent_id, key).await? {
                return Ok(CreateOutcome::Existing(existing));
            }
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;

        match insert_execution(&mut tx, &workflow, Utc::now()).await {
            Ok(()) => {}
            Err(StoreError::DuplicateKey(constraint)) => {
                drop(tx);
                // Lost the race to a concurrent start under the same key
                let key = workflow.idempotency_key.as_deref().unwrap_or_default();
                return self
                    .execution_by_key(workflow.parent_id, key)
                    .await?
                    .map(CreateOutcome::Existing)
                    .ok_or(StoreError::DuplicateKey(constraint));
            }
            Err(e) => return Err(e),
        }

        tx.commit()
            .await
            .map_err(|e| db_error("commit execution", e))?;

        debug!(workflow_id = %workflow.id, "created workflow execution");
        Ok(CreateOutcome::Created(workflow.id))
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM durable_workflow_executions WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("get workflow", e))?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        workflow_from_row(&row)
    }

    #[instrument(skip(self, batch), fields(workflow_id = %batch.workflow_id, expected = batch.expected_sequence))]
    async fn commit(&self, batch: CommitBatch) -> Result<i64, StoreError> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;

        // Row lock serializes appends to one log
        let row = sqlx::query(
            r#"
            SELECT status, last_sequence, claimed_by
            FROM durable_workflow_executions
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(batch.workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("lock workflow", e))?
        .ok_or(StoreError::WorkflowNotFound(batch.workflow_id))?;

        let last_sequence: i64 = row.try_get("last_sequence").map_err(decode_error)?;
        if last_sequence != batch.expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: batch.expected_sequence,
                actual: last_sequence,
            });
        }
        let claimed_by: Option<String> = row.try_get("claimed_by").map_err(decode_error)?;
        if let Some(worker_id) = &batch.claimed_by {
            if claimed_by.as_deref() != Some(worker_id.as_str()) {
                return Err(StoreError::LeaseExpired(batch.workflow_id));
            }
        }
        let current: String = row.try_get("status").map_err(decode_error)?;
        let current: WorkflowStatus = parse_status(&current)?;

        let mut sequence = last_sequence;
        for event in &batch.events {
            sequence += 1;
            insert_event(&mut tx, batch.workflow_id, sequence, event, now).await?;
        }

        let became_claimable = batch
            .status
            .is_some_and(|s| s.is_claimable() && !current.is_claimable());
        let became_terminal = batch
            .status
            .is_some_and(|s| s.is_terminal() && !current.is_terminal());
        let release = batch.release_claim || became_terminal;

        sqlx::query(
            r#"
            UPDATE durable_workflow_executions
            SET last_sequence = $2,
                updated_at = $3,
                status = COALESCE($4, status),
                ready_at = CASE WHEN $5 THEN $3 ELSE ready_at END,
                parent_notify_pending = CASE WHEN $6 THEN parent_id IS NOT NULL
                                             ELSE parent_notify_pending END,
                claimed_by = CASE WHEN $7 THEN NULL ELSE claimed_by END,
                lease_expires_at = CASE WHEN $7 THEN NULL ELSE lease_expires_at END
            WHERE id = $1
            "#,
        )
        .bind(batch.workflow_id)
        .bind(sequence)
        .bind(now)
        .bind(batch.status.map(|s| s.as_str()))
        .bind(became_claimable)
        .bind(became_terminal)
        .bind(release)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("update workflow", e))?;

        for workflow in &batch.new_workflows {
            insert_execution(&mut tx, workflow, now).await?;
        }
        for task in &batch.new_tasks {
            insert_task(&mut tx, task, now).await?;
        }

        if !batch.cancel_tasks.is_empty() {
            sqlx::query(
                r#"
                UPDATE durable_tasks
                SET status = CASE WHEN status = 'pending' THEN 'cancelled' ELSE status END,
                    cancel_requested = cancel_requested OR status = 'running',
                    updated_at = $2
                WHERE id = ANY($1) AND status IN ('pending', 'running')
                "#,
            )
            .bind(&batch.cancel_tasks)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("cancel tasks", e))?;
        }

        if let Some(settlement) = &batch.settle_task {
            settle_claimed(&mut tx, settlement, now).await?;
        }

        for promise in &batch.promise_keys {
            sqlx::query(
                r#"
                INSERT INTO durable_promise_keys (key, workflow_id, promise_id)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(&promise.key)
            .bind(promise.workflow_id)
            .bind(&promise.promise_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("register promise key", e))?;
        }

        for key in &batch.cleared_wakeups {
            sqlx::query(
                "DELETE FROM durable_wakeups WHERE workflow_id = $1 AND kind = $2 AND target = $3",
            )
            .bind(key.workflow_id)
            .bind(key.kind.as_str())
            .bind(&key.target)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("clear wakeup", e))?;
        }
        for wakeup in &batch.wakeups {
            sqlx::query(
                r#"
                INSERT INTO durable_wakeups (workflow_id, kind, target, due_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (workflow_id, kind, target) DO UPDATE SET due_at = EXCLUDED.due_at
                "#,
            )
            .bind(wakeup.key.workflow_id)
            .bind(wakeup.key.kind.as_str())
            .bind(&wakeup.key.target)
            .bind(wakeup.due_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("register wakeup", e))?;
        }
        if became_terminal {
            sqlx::query("DELETE FROM durable_wakeups WHERE workflow_id = $1")
                .bind(batch.workflow_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("clear wakeups", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("commit batch", e))?;

        debug!(workflow_id = %batch.workflow_id, sequence, "committed batch");
        Ok(sequence)
    }

    #[instrument(skip(self))]
    async fn read_events(
        &self,
        workflow_id: Uuid,
        from_sequence: i64,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, event_data, recorded_at
            FROM durable_workflow_events
            WHERE workflow_id = $1 AND sequence >= $2
            ORDER BY sequence
            "#,
        )
        .bind(workflow_id)
        .bind(from_sequence)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("read events", e))?;

        if rows.is_empty() && from_sequence <= 1 {
            // Distinguish an unknown execution from an empty tail
            self.get_workflow(workflow_id).await?;
        }

        rows.iter()
            .map(|row| {
                let data: serde_json::Value = row.try_get("event_data").map_err(decode_error)?;
                Ok(EventEnvelope {
                    workflow_id,
                    sequence: row.try_get("sequence").map_err(decode_error)?,
                    event: serde_json::from_value(data)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                    recorded_at: row.try_get("recorded_at").map_err(decode_error)?,
                })
            })
            .collect()
    }

    async fn find_child(&self, parent_id: Uuid, key: &str) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(
            "SELECT id FROM durable_workflow_executions WHERE parent_id = $1 AND idempotency_key = $2",
        )
        .bind(parent_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find child", e))?;
        row.map(|r| r.try_get("id").map_err(decode_error))
            .transpose()
    }

    async fn find_promise(&self, key: &str) -> Result<Option<PromiseKey>, StoreError> {
        let row = sqlx::query(
            "SELECT key, workflow_id, promise_id FROM durable_promise_keys WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find promise", e))?;

        row.map(|r| {
            Ok(PromiseKey {
                key: r.try_get("key").map_err(decode_error)?,
                workflow_id: r.try_get("workflow_id").map_err(decode_error)?,
                promise_id: r.try_get("promise_id").map_err(decode_error)?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn claim_workflow(
        &self,
        worker_id: &str,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<WorkflowClaim>, StoreError> {
        let now = Utc::now();
        let lease_expires_at = lease_deadline(now, lease);

        let row = sqlx::query(
            r#"
            UPDATE durable_workflow_executions w
            SET claimed_by = $1, lease_expires_at = $3, updated_at = $4
            WHERE w.id = (
                SELECT id FROM durable_workflow_executions
                WHERE queue = $2
                  AND status IN ('pending', 'running')
                  AND (claimed_by IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= $4)
                ORDER BY ready_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING w.*
            "#,
        )
        .bind(worker_id)
        .bind(queue)
        .bind(lease_expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("claim workflow", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let workflow = workflow_from_row(&row)?;
        debug!(worker_id, workflow_id = %workflow.id, "claimed workflow");
        Ok(Some(WorkflowClaim {
            workflow,
            worker_id: worker_id.to_string(),
            lease_expires_at,
        }))
    }

    async fn heartbeat_workflow(
        &self,
        workflow_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<HeartbeatResponse, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE durable_workflow_executions
            SET lease_expires_at = $3
            WHERE id = $1 AND claimed_by = $2
            RETURNING status
            "#,
        )
        .bind(workflow_id)
        .bind(worker_id)
        .bind(lease_deadline(Utc::now(), lease))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("heartbeat workflow", e))?;

        let Some(row) = row else {
            return Ok(HeartbeatResponse::rejected());
        };
        let status: String = row.try_get("status").map_err(decode_error)?;
        Ok(HeartbeatResponse {
            accepted: true,
            should_cancel: !matches!(status.as_str(), "pending" | "running"),
        })
    }

    async fn release_workflow(
        &self,
        workflow_id: Uuid,
        worker_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE durable_workflow_executions
            SET claimed_by = NULL, lease_expires_at = NULL, updated_at = NOW()
            WHERE id = $1 AND claimed_by = $2
            "#,
        )
        .bind(workflow_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("release workflow", e))?;
        Ok(())
    }

    #[instrument(skip(self, task), fields(kind = %task.kind))]
    async fn enqueue_task(&self, task: NewTask) -> Result<CreateOutcome, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| db_error("acquire connection", e))?;

        match insert_task(&mut conn, &task, Utc::now()).await {
            Ok(()) => {
                debug!(task_id = %task.id, "enqueued task");
                Ok(CreateOutcome::Created(task.id))
            }
            Err(StoreError::DuplicateKey(constraint)) if task.workflow_id.is_none() => {
                let row = sqlx::query(
                    "SELECT id FROM durable_tasks WHERE workflow_id IS NULL AND idempotency_key = $1",
                )
                .bind(&task.idempotency_key)
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| db_error("look up task key", e))?
                .ok_or(StoreError::DuplicateKey(constraint))?;
                Ok(CreateOutcome::Existing(
                    row.try_get("id").map_err(decode_error)?,
                ))
            }
            Err(e) => Err(e),
        }
    }

    async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM durable_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("get task", e))?
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task_from_row(&row)
    }

    async fn find_task_by_key(&self, key: &str) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(
            "SELECT id FROM durable_tasks WHERE workflow_id IS NULL AND idempotency_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find task by key", e))?;
        row.map(|r| r.try_get("id").map_err(decode_error))
            .transpose()
    }

    #[instrument(skip(self))]
    async fn claim_task(
        &self,
        worker_id: &str,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<TaskClaim>, StoreError> {
        let now = Utc::now();
        let lease_expires_at = lease_deadline(now, lease);

        let row = sqlx::query(
            r#"
            UPDATE durable_tasks t
            SET status = 'running',
                attempt = t.attempt + 1,
                claimed_by = $1,
                lease_expires_at = $3,
                updated_at = $4
            WHERE t.id = (
                SELECT id FROM durable_tasks
                WHERE queue = $2 AND status = 'pending' AND visible_at <= $4
                ORDER BY visible_at, created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING t.*
            "#,
        )
        .bind(worker_id)
        .bind(queue)
        .bind(lease_expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("claim task", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let task = task_from_row(&row)?;
        debug!(worker_id, task_id = %task.id, attempt = task.attempt, "claimed task");
        Ok(Some(TaskClaim {
            task,
            worker_id: worker_id.to_string(),
            lease_expires_at,
        }))
    }

    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<HeartbeatResponse, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE durable_tasks
            SET lease_expires_at = $3, updated_at = NOW()
            WHERE id = $1 AND claimed_by = $2 AND status = 'running'
            RETURNING cancel_requested
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(lease_deadline(Utc::now(), lease))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("heartbeat task", e))?;

        match row {
            Some(row) => Ok(HeartbeatResponse {
                accepted: true,
                should_cancel: row.try_get("cancel_requested").map_err(decode_error)?,
            }),
            None => Ok(HeartbeatResponse::rejected()),
        }
    }

    async fn settle_task(&self, settlement: TaskSettlement) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| db_error("acquire connection", e))?;
        settle_claimed(&mut conn, &settlement, Utc::now()).await
    }

    async fn retry_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        attempt: u32,
        visible_at: DateTime<Utc>,
        error: &TaskError,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE durable_tasks
            SET status = CASE WHEN cancel_requested THEN 'cancelled' ELSE 'pending' END,
                claimed_by = NULL,
                lease_expires_at = NULL,
                visible_at = $4,
                error = $5,
                updated_at = NOW()
            WHERE id = $1 AND claimed_by = $2 AND attempt = $3 AND status = 'running'
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(attempt as i32)
        .bind(visible_at)
        .bind(to_json(error)?)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("retry task", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseExpired(task_id));
        }
        Ok(())
    }

    async fn expired_task_claims(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM durable_tasks
            WHERE status = 'running' AND lease_expires_at < $1
            ORDER BY lease_expires_at, id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list expired tasks", e))?;
        rows.iter().map(task_from_row).collect()
    }

    async fn requeue_task(&self, task_id: Uuid, attempt: u32) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE durable_tasks
            SET status = 'pending', claimed_by = NULL, lease_expires_at = NULL,
                visible_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND attempt = $2 AND status = 'running' AND attempt <= max_retries
            "#,
        )
        .bind(task_id)
        .bind(attempt as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("requeue task", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_claimable(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<ClaimCandidate>, StoreError> {
        let now = Utc::now();
        let workflows = sqlx::query(
            r#"
            SELECT id, kind, ready_at FROM durable_workflow_executions
            WHERE queue = $1
              AND status IN ('pending', 'running')
              AND (claimed_by IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= $2)
            ORDER BY ready_at, id
            LIMIT $3
            "#,
        )
        .bind(queue)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list claimable workflows", e))?;

        let tasks = sqlx::query(
            r#"
            SELECT id, kind, visible_at AS ready_at FROM durable_tasks
            WHERE queue = $1 AND status = 'pending' AND visible_at <= $2
            ORDER BY visible_at, id
            LIMIT $3
            "#,
        )
        .bind(queue)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list claimable tasks", e))?;

        let candidate = |row: &PgRow, work: WorkKind| -> Result<ClaimCandidate, StoreError> {
            Ok(ClaimCandidate {
                work,
                id: row.try_get("id").map_err(decode_error)?,
                kind: row.try_get("kind").map_err(decode_error)?,
                ready_at: row.try_get("ready_at").map_err(decode_error)?,
            })
        };

        let mut candidates = workflows
            .iter()
            .map(|r| candidate(r, WorkKind::Workflow))
            .chain(tasks.iter().map(|r| candidate(r, WorkKind::Task)))
            .collect::<Result<Vec<_>, _>>()?;
        candidates.sort_by_key(|c| (c.ready_at, c.id));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn due_wakeups(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Wakeup>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, kind, target, due_at FROM durable_wakeups
            WHERE due_at <= $1
            ORDER BY due_at, workflow_id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list due wakeups", e))?;

        rows.iter()
            .map(|row| {
                let kind: String = row.try_get("kind").map_err(decode_error)?;
                Ok(Wakeup {
                    key: WakeupKey {
                        workflow_id: row.try_get("workflow_id").map_err(decode_error)?,
                        kind: WakeupKind::parse(&kind).ok_or_else(|| {
                            StoreError::Serialization(format!("unknown wakeup kind: {kind}"))
                        })?,
                        target: row.try_get("target").map_err(decode_error)?,
                    },
                    due_at: row.try_get("due_at").map_err(decode_error)?,
                })
            })
            .collect()
    }

    async fn cancelling_workflows(&self, limit: usize) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM durable_workflow_executions
            WHERE status = 'cancelling'
            ORDER BY updated_at, id
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list cancelling workflows", e))?;
        rows.iter()
            .map(|r| r.try_get("id").map_err(decode_error))
            .collect()
    }

    async fn pending_parent_notifications(
        &self,
        limit: usize,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM durable_workflow_executions
            WHERE parent_notify_pending
            ORDER BY updated_at, id
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list parent notifications", e))?;
        rows.iter().map(workflow_from_row).collect()
    }

    async fn mark_parent_notified(&self, child_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE durable_workflow_executions SET parent_notify_pending = FALSE WHERE id = $1",
        )
        .bind(child_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("mark parent notified", e))?;
        Ok(())
    }
}

async fn settle_claimed(
    conn: &mut PgConnection,
    settlement: &TaskSettlement,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let error = settlement.error.as_ref().map(to_json).transpose()?;
    let result = sqlx::query(
        r#"
        UPDATE durable_tasks
        SET status = $4, output = $5, error = $6,
            claimed_by = NULL, lease_expires_at = NULL, updated_at = $7
        WHERE id = $1 AND claimed_by = $2 AND attempt = $3 AND status = 'running'
        "#,
    )
    .bind(settlement.task_id)
    .bind(&settlement.worker_id)
    .bind(settlement.attempt as i32)
    .bind(settlement.status.as_str())
    .bind(&settlement.output)
    .bind(error)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| db_error("settle task", e))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::LeaseExpired(settlement.task_id));
    }
    Ok(())
}
