//! PostgreSQL implementation of BuildRequestStore.

use async_trait::async_trait;
use chrono::Utc;
use kiln_core::change::{Change, ClassifiedChanges, NewChange, Properties, SourceStamp};
use kiln_core::ids::{BuildRequestId, ChangeId, SchedulerId, SourceStampId};
use kiln_core::ports::{BuildRequestStore, StoreTransaction};
use kiln_core::request::{BuildRequest, BuildRequestStatus, NewBuildRequest};
use kiln_core::{Error, Result};
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

/// Advisory lock held by `add_change` until its insert commits. Change
/// numbers therefore become visible in increasing order, which is what lets
/// a scheduler's watermark skip everything at or below it.
pub const CHANGE_LOCK_KEY: i64 = 0x6b69_6c6e;

/// Channel notified with the change number after each `add_change` commit.
pub const CHANGE_CHANNEL: &str = "kiln_changes";

const CHANGE_COLUMNS: &str =
    "c.id, c.author, c.branch, c.revision, c.comments, c.files, c.properties, c.when_timestamp";

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

fn row_to_change(r: &PgRow) -> Result<Change> {
    let files: Vec<String> = serde_json::from_value(r.get("files"))?;
    let properties: Properties = serde_json::from_value(r.get("properties"))?;

    Ok(Change {
        id: ChangeId::new(r.get("id")),
        author: r.get("author"),
        branch: r.get("branch"),
        revision: r.get("revision"),
        comments: r.get("comments"),
        files,
        when: r.get("when_timestamp"),
        properties,
    })
}

fn row_to_request(r: &PgRow) -> Result<BuildRequest> {
    let status: String = r.get("status");
    let properties: Properties = serde_json::from_value(r.get("properties"))?;

    Ok(BuildRequest {
        id: BuildRequestId::from_uuid(r.get::<uuid::Uuid, _>("id")),
        source_stamp_id: SourceStampId::from_uuid(r.get::<uuid::Uuid, _>("source_stamp_id")),
        builder_name: r.get("builder_name"),
        reason: r.get("reason"),
        properties,
        status: BuildRequestStatus::parse(&status)
            .ok_or_else(|| Error::Serialization(format!("unknown request status: {status}")))?,
        submitted_at: r.get("submitted_at"),
    })
}

/// Store backed by the tables in `migrations/`.
#[derive(Clone)]
pub struct PgBuildRequestStore {
    pool: PgPool,
}

impl PgBuildRequestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Requests submitted for a builder, oldest first.
    pub async fn build_requests_for(&self, builder_name: &str) -> Result<Vec<BuildRequest>> {
        let rows = sqlx::query(
            "SELECT id, source_stamp_id, builder_name, reason, properties, status, submitted_at FROM build_requests WHERE builder_name = $1 ORDER BY submitted_at ASC",
        )
        .bind(builder_name)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_request).collect()
    }

    /// Subscribe to change notifications.
    pub async fn change_feed(&self) -> Result<ChangeFeed> {
        ChangeFeed::connect(&self.pool).await
    }

    pub async fn set_request_status(
        &self,
        id: BuildRequestId,
        status: BuildRequestStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE build_requests SET status = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl BuildRequestStore for PgBuildRequestStore {
    async fn add_change(&self, change: NewChange) -> Result<Change> {
        let files = serde_json::to_value(&change.files)?;
        let properties = serde_json::to_value(&change.properties)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CHANGE_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let row = sqlx::query(
            r#"INSERT INTO changes (author, branch, revision, comments, files, properties, when_timestamp)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING id"#,
        )
        .bind(&change.author)
        .bind(&change.branch)
        .bind(&change.revision)
        .bind(&change.comments)
        .bind(&files)
        .bind(&properties)
        .bind(change.when)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let id = ChangeId::new(row.get("id"));

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANGE_CHANNEL)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(change.into_change(id))
    }

    async fn unseen_changes(&self, scheduler: &SchedulerId) -> Result<Vec<Change>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHANGE_COLUMNS} FROM changes c WHERE c.id > COALESCE((SELECT last_seen_change FROM scheduler_state WHERE scheduler_id = $1), 0) ORDER BY c.id ASC"
        ))
        .bind(scheduler.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_change).collect()
    }

    async fn record_classification(
        &self,
        scheduler: &SchedulerId,
        classified: &ClassifiedChanges,
        seen_up_to: ChangeId,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "INSERT INTO scheduler_state (scheduler_id, last_seen_change) VALUES ($1, 0) ON CONFLICT (scheduler_id) DO NOTHING",
        )
        .bind(scheduler.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(
            "SELECT last_seen_change FROM scheduler_state WHERE scheduler_id = $1 FOR UPDATE",
        )
        .bind(scheduler.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let watermark: i64 = row.get("last_seen_change");

        let entries = classified
            .important
            .iter()
            .map(|c| (c, true))
            .chain(classified.unimportant.iter().map(|c| (c, false)))
            .filter(|(c, _)| c.id.get() > watermark);
        for (change, important) in entries {
            sqlx::query(
                r#"INSERT INTO scheduler_changes (scheduler_id, change_id, important)
                   VALUES ($1, $2, $3)
                   ON CONFLICT (scheduler_id, change_id) DO UPDATE SET important = EXCLUDED.important"#,
            )
            .bind(scheduler.as_str())
            .bind(change.id.get())
            .bind(important)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        sqlx::query(
            "UPDATE scheduler_state SET last_seen_change = GREATEST(last_seen_change, $2) WHERE scheduler_id = $1",
        )
        .bind(scheduler.as_str())
        .bind(seen_up_to.get())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)
    }

    async fn get_classified_changes(&self, scheduler: &SchedulerId) -> Result<ClassifiedChanges> {
        let rows = sqlx::query(&format!(
            "SELECT {CHANGE_COLUMNS}, sc.important FROM scheduler_changes sc JOIN changes c ON c.id = sc.change_id WHERE sc.scheduler_id = $1 ORDER BY c.id ASC"
        ))
        .bind(scheduler.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut classified = ClassifiedChanges::default();
        for row in &rows {
            let change = row_to_change(row)?;
            if row.get::<bool, _>("important") {
                classified.important.push(change);
            } else {
                classified.unimportant.push(change);
            }
        }
        Ok(classified)
    }

    async fn count_pending_requests(&self, builder_name: &str) -> Result<usize> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS pending FROM build_requests WHERE builder_name = $1 AND status = 'pending'",
        )
        .bind(builder_name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get::<i64, _>("pending") as usize)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(PgStoreTransaction { tx }))
    }
}

/// Numbers of changes committed through [`PgBuildRequestStore::add_change`],
/// from any process sharing the database.
pub struct ChangeFeed {
    listener: PgListener,
}

impl ChangeFeed {
    pub async fn connect(pool: &PgPool) -> Result<Self> {
        let mut listener = PgListener::connect_with(pool).await.map_err(db_err)?;
        listener.listen(CHANGE_CHANNEL).await.map_err(db_err)?;
        Ok(Self { listener })
    }

    /// Wait for the next committed change.
    pub async fn recv(&mut self) -> Result<ChangeId> {
        let notification = self.listener.recv().await.map_err(db_err)?;
        let payload = notification.payload();
        payload.parse::<i64>().map(ChangeId::new).map_err(|e| {
            Error::Serialization(format!("bad change notification {payload:?}: {e}"))
        })
    }
}

/// A `sqlx` transaction; rolled back if dropped before commit.
pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn get_or_create_source_stamp(&mut self, stamp: &SourceStamp) -> Result<SourceStampId> {
        let key = stamp.key();
        let change_ids: Vec<i64> = stamp.changes.iter().map(|c| c.get()).collect();

        // Blocks on a concurrent insert of the same key until that
        // transaction finishes; the select then sees whichever row won.
        sqlx::query(
            r#"INSERT INTO source_stamps (id, stamp_key, branch, revision, change_ids)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (stamp_key) DO NOTHING"#,
        )
        .bind(SourceStampId::new().as_uuid())
        .bind(&key)
        .bind(&stamp.branch)
        .bind(&stamp.revision)
        .bind(&change_ids)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;

        let row = sqlx::query("SELECT id FROM source_stamps WHERE stamp_key = $1")
            .bind(&key)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(db_err)?;

        Ok(SourceStampId::from_uuid(row.get::<uuid::Uuid, _>("id")))
    }

    async fn create_build_request(
        &mut self,
        request: &NewBuildRequest,
    ) -> Result<Vec<BuildRequestId>> {
        if request.builder_names.is_empty() {
            return Err(Error::Internal("build request names no builders".into()));
        }
        let properties = serde_json::to_value(&request.properties)?;
        let submitted_at = Utc::now();

        let mut ids = Vec::with_capacity(request.builder_names.len());
        for builder_name in &request.builder_names {
            let id = BuildRequestId::new();
            sqlx::query(
                r#"INSERT INTO build_requests (id, source_stamp_id, builder_name, reason, properties, status, submitted_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
            )
            .bind(id.as_uuid())
            .bind(request.source_stamp_id.as_uuid())
            .bind(builder_name)
            .bind(&request.reason)
            .bind(&properties)
            .bind(BuildRequestStatus::Pending.as_str())
            .bind(submitted_at)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn retire_changes(
        &mut self,
        scheduler: &SchedulerId,
        changes: &[ChangeId],
    ) -> Result<()> {
        let ids: Vec<i64> = changes.iter().map(|c| c.get()).collect();
        sqlx::query("DELETE FROM scheduler_changes WHERE scheduler_id = $1 AND change_id = ANY($2)")
            .bind(scheduler.as_str())
            .bind(&ids)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| Error::TransactionAborted(e.to_string()))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(db_err)
    }
}
