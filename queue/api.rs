use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use taskq_database::{new_uuid, sql_insert_parameters, PostgresPool};
use taskq_graceful_shutdown::GracefulShutdownConsumer;
use tracing::{event, instrument, Level};
use uuid::Uuid;

use crate::listener::NotificationListener;
use crate::registry::DequeuerRegistry;
use crate::task::{Heartbeat, NewTask, TaskInfo, TaskRow, TaskStatus};
use crate::{Error, Result};

struct QueueInner {
    pool: PostgresPool,
    registry: DequeuerRegistry,
    // Held only to keep the background listener task alive for as long as the queue is; never
    // read directly.
    _listener: NotificationListener,
}

/// The task queue. Cheap to clone: every clone shares the same connection pool, dequeuer
/// registry, and background notification listener.
#[derive(Clone)]
pub struct Queue(Arc<QueueInner>);

impl Queue {
    /// Starts the background notification listener and returns once it has a live `LISTEN` in
    /// place. `shutdown` is consulted by both the listener and any in-flight `Dequeue` call that
    /// was not given its own, more specific, cancellation signal.
    pub async fn new(pool: PostgresPool, shutdown: GracefulShutdownConsumer) -> Result<Queue> {
        let registry = DequeuerRegistry::new();
        let listener = NotificationListener::new(pool.clone(), registry.clone(), shutdown).await?;

        Ok(Queue(Arc::new(QueueInner {
            pool,
            registry,
            _listener: listener,
        })))
    }

    /// Inserts a new task, along with rows recording each of `task.dependencies`. Returns the
    /// new task's id. Enqueuing never blocks on dependencies existing yet; `Dequeue` simply
    /// treats a task with an unsatisfied dependency as not-yet-ready.
    #[instrument(skip(self, task), fields(task_type = %task.task_type))]
    pub async fn enqueue(&self, task: NewTask) -> Result<Uuid> {
        let id = new_uuid();

        let mut tx = self.0.pool.begin().await?;

        sqlx::query(
            r##"INSERT INTO tasks
                (id, type, payload, org_id, repository_uuid, request_id)
                VALUES ($1, $2, $3, $4, $5, $6)"##,
        )
        .bind(id)
        .bind(&task.task_type)
        .bind(&task.payload)
        .bind(&task.org_id)
        .bind(task.repository_uuid)
        .bind(&task.request_id)
        .execute(&mut tx)
        .await?;

        if !task.dependencies.is_empty() {
            let sql = format!(
                r##"INSERT INTO task_dependencies (task_id, dependency_id) VALUES {}"##,
                sql_insert_parameters::<2>(task.dependencies.len())
            );

            let mut query = sqlx::query(&sql);
            for dependency_id in &task.dependencies {
                query = query.bind(id).bind(*dependency_id);
            }
            query.execute(&mut tx).await?;
        }

        tx.commit().await?;

        // Enqueuing a task that is immediately ready (no dependencies, or dependencies already
        // terminal) wakes waiters itself via the `tasks_notify_queued` trigger; nothing further
        // to do here.

        Ok(id)
    }

    /// Claims the oldest ready task whose type is in `task_types`, blocking until one is
    /// available or `cancel` fires. A task is ready when it is `pending` and every row in
    /// `task_dependencies` naming it as `task_id` points at a dependency that has reached a
    /// terminal status.
    #[instrument(skip(self, cancel))]
    pub async fn dequeue(
        &self,
        task_types: &[String],
        mut cancel: GracefulShutdownConsumer,
    ) -> Result<TaskInfo> {
        let (_registration, mut wake_rx) = self.0.registry.register();

        loop {
            if let Some(task) = self.try_claim(task_types).await? {
                return Ok(task);
            }

            if cancel.shutting_down() {
                return Err(Error::ContextCanceled);
            }

            tokio::select! {
                _ = wake_rx.recv() => {}
                _ = cancel.wait_for_shutdown() => return Err(Error::ContextCanceled),
            }
        }
    }

    async fn try_claim(&self, task_types: &[String]) -> Result<Option<TaskInfo>> {
        let token = new_uuid();

        let mut tx = self.0.pool.begin().await?;

        let row: Option<TaskRow> = sqlx::query_as(
            r##"WITH candidate AS (
                    SELECT t.id
                    FROM tasks t
                    WHERE t.status = 'pending'
                      AND t.type = ANY($1)
                      AND NOT EXISTS (
                        SELECT 1
                        FROM task_dependencies d
                        JOIN tasks dep ON dep.id = d.dependency_id
                        WHERE d.task_id = t.id
                          AND dep.status NOT IN ('completed', 'failed', 'canceled')
                      )
                    ORDER BY t.queued_at
                    LIMIT 1
                    FOR UPDATE OF t SKIP LOCKED
                )
                UPDATE tasks
                SET status = 'running', token = $2, started_at = statement_timestamp()
                FROM candidate
                WHERE tasks.id = candidate.id
                RETURNING tasks.*"##,
        )
        .bind(task_types)
        .bind(token)
        .fetch_optional(&mut tx)
        .await?;

        let row = match row {
            Some(row) => row,
            None => {
                tx.rollback().await?;
                return Ok(None);
            }
        };

        sqlx::query(r##"INSERT INTO task_heartbeats (token, id, heartbeat) VALUES ($1, $2, now())"##)
            .bind(token)
            .bind(row.id)
            .execute(&mut tx)
            .await?;

        let dependencies = fetch_dependencies(&mut tx, row.id).await?;

        tx.commit().await?;

        event!(Level::DEBUG, task_id = %row.id, %token, "claimed task");

        Ok(Some(TaskInfo::from_row(row, dependencies)))
    }

    /// Overwrites a task's payload in place. Callers use this to checkpoint progress on a
    /// long-running task without finishing it.
    pub async fn update_payload(&self, id: Uuid, payload: Option<serde_json::Value>) -> Result<()> {
        let result = sqlx::query(r##"UPDATE tasks SET payload = $2 WHERE id = $1"##)
            .bind(id)
            .bind(payload)
            .execute(&self.0.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotExist);
        }

        Ok(())
    }

    /// Transitions a `running` task to `completed` (if `error` is `None`) or `failed`, releasing
    /// its lease. Succeeding or failing a task that isn't `running` is an error: the caller has
    /// lost its lease, most likely to the reaper. The `tasks_notify_finished` trigger wakes any
    /// dequeuer blocked on a dependent that just became ready.
    #[instrument(skip(self))]
    pub async fn finish(&self, id: Uuid, error: Option<String>) -> Result<()> {
        let status = if error.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };

        let mut tx = self.0.pool.begin().await?;

        let result = sqlx::query(
            r##"UPDATE tasks
                SET status = $2, error = $3, finished_at = now()
                WHERE id = $1 AND status = 'running'"##,
        )
        .bind(id)
        .bind(status)
        .bind(&error)
        .execute(&mut tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.classify_not_running(id).await?);
        }

        let heartbeat_result = sqlx::query(r##"DELETE FROM task_heartbeats WHERE id = $1"##)
            .bind(id)
            .execute(&mut tx)
            .await?;

        if heartbeat_result.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(Error::NotExist);
        }

        tx.commit().await?;

        Ok(())
    }

    /// Cancels a task, as long as it hasn't already finished. Deliberately leaves the heartbeat
    /// row in place and emits no notification: the worker that still holds the token is expected
    /// to notice (via `Status`/`RefreshHeartbeat`) and clean up through its own `Finish` or
    /// `Requeue` call.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r##"UPDATE tasks
                SET status = 'canceled', finished_at = now()
                WHERE id = $1 AND finished_at IS NULL"##,
        )
        .bind(id)
        .execute(&self.0.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotRunning);
        }

        Ok(())
    }

    /// Moves a `running` task back to `pending`, clearing its lease so a future `Dequeue` can
    /// claim it again. Used by the reaper when a heartbeat goes stale, and available to callers
    /// directly for manual retry.
    #[instrument(skip(self))]
    pub async fn requeue(&self, id: Uuid) -> Result<()> {
        let mut tx = self.0.pool.begin().await?;

        let result = sqlx::query(
            r##"UPDATE tasks
                SET status = 'pending', token = NULL, started_at = NULL
                WHERE id = $1 AND status = 'running'"##,
        )
        .bind(id)
        .execute(&mut tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.classify_not_running(id).await?);
        }

        let heartbeat_result = sqlx::query(r##"DELETE FROM task_heartbeats WHERE id = $1"##)
            .bind(id)
            .execute(&mut tx)
            .await?;

        if heartbeat_result.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(Error::NotExist);
        }

        tx.commit().await?;

        Ok(())
    }

    /// Reads the current state of a task, including its dependency ids.
    pub async fn status(&self, id: Uuid) -> Result<TaskInfo> {
        let mut conn = self.0.pool.acquire().await?;

        let row: Option<TaskRow> = sqlx::query_as(r##"SELECT * FROM tasks WHERE id = $1"##)
            .bind(id)
            .fetch_optional(&mut conn)
            .await?;

        let row = row.ok_or(Error::NotExist)?;
        let dependencies = fetch_dependencies(&mut conn, id).await?;

        Ok(TaskInfo::from_row(row, dependencies))
    }

    /// Resolves an opaque lease token, handed out by `Dequeue`, back to the task id it was
    /// issued for. Returns `(id, still_running)`: a worker that refreshes a heartbeat for a
    /// token whose task has already been requeued or finished needs to know to stop working.
    pub async fn id_from_token(&self, token: Uuid) -> Result<(Uuid, bool)> {
        let row: Option<(Uuid, TaskStatus)> =
            sqlx::query_as(r##"SELECT id, status FROM tasks WHERE token = $1"##)
                .bind(token)
                .fetch_optional(&self.0.pool)
                .await?;

        let (id, status) = row.ok_or(Error::NotExist)?;
        Ok((id, status == TaskStatus::Running))
    }

    /// Lists every outstanding lease whose heartbeat is older than `older_than`. Read-only: the
    /// reaper is responsible for acting on what comes back, via `Requeue`.
    pub async fn heartbeats(&self, older_than: Duration) -> Result<Vec<Heartbeat>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());

        let rows: Vec<(Uuid, Uuid, chrono::DateTime<Utc>)> = sqlx::query_as(
            r##"SELECT token, id, heartbeat FROM task_heartbeats WHERE heartbeat < $1"##,
        )
        .bind(cutoff)
        .fetch_all(&self.0.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(token, id, heartbeat)| Heartbeat { token, id, heartbeat })
            .collect())
    }

    /// Bumps the heartbeat timestamp for `token`. A nil token is a no-op. If the update affects
    /// no rows, retries once after checking `IdFromToken`: a task can still be `running` for a
    /// few microseconds after `Dequeue` commits before its heartbeat row is visible to this
    /// connection. If the task isn't running any more — it finished, was canceled, or was
    /// requeued out from under the caller — that's not this caller's problem any more, so the
    /// call succeeds silently. Only a task that is still running but whose heartbeat update
    /// fails twice is a real error.
    #[instrument(skip(self))]
    pub async fn refresh_heartbeat(&self, token: Uuid) -> Result<()> {
        if token.is_nil() {
            return Ok(());
        }

        if self.try_refresh_heartbeat(token).await? {
            return Ok(());
        }

        let still_running = matches!(self.id_from_token(token).await, Ok((_, true)));
        if !still_running {
            return Ok(());
        }

        if self.try_refresh_heartbeat(token).await? {
            return Ok(());
        }

        Err(Error::RowsNotAffected)
    }

    async fn try_refresh_heartbeat(&self, token: Uuid) -> Result<bool> {
        let result = sqlx::query(r##"UPDATE task_heartbeats SET heartbeat = now() WHERE token = $1"##)
            .bind(token)
            .execute(&self.0.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deletes every task, dependency edge, and heartbeat. Intended for test teardown and
    /// administrative resets, not for use against a live workload.
    pub async fn remove_all_tasks(&self) -> Result<()> {
        let mut tx = self.0.pool.begin().await?;
        sqlx::query("DELETE FROM task_heartbeats").execute(&mut tx).await?;
        sqlx::query("DELETE FROM task_dependencies").execute(&mut tx).await?;
        sqlx::query("DELETE FROM tasks").execute(&mut tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// `finish`/`requeue` only affect `running` rows; when the affected-row count is zero, this
    /// figures out why so the caller gets a specific error instead of a bare `RowsNotAffected`.
    async fn classify_not_running(&self, id: Uuid) -> Result<Error> {
        let status: Option<TaskStatus> =
            sqlx::query_scalar(r##"SELECT status FROM tasks WHERE id = $1"##)
                .bind(id)
                .fetch_optional(&self.0.pool)
                .await?;

        Ok(match status {
            None => Error::NotExist,
            Some(TaskStatus::Canceled) => Error::Canceled,
            Some(_) => Error::NotRunning,
        })
    }
}

async fn fetch_dependencies(
    conn: impl sqlx::PgExecutor<'_>,
    task_id: Uuid,
) -> Result<Vec<Uuid>> {
    let ids: Vec<Uuid> = sqlx::query_scalar(
        r##"SELECT dependency_id FROM task_dependencies WHERE task_id = $1"##,
    )
    .bind(task_id)
    .fetch_all(conn)
    .await?;

    Ok(ids)
}
