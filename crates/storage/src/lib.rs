use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError, sqlite::SqlitePoolOptions, Row, Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;

use clubhub_core::email::{EmailReceiver, EmailSendStatus, EmailTask, EmailTaskInfo};
use clubhub_core::member::{Event, Member, MemberStatus};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for interacting with member records.
    pub fn members(&self) -> MemberRepository {
        MemberRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for interacting with club events.
    pub fn events(&self) -> EventRepository {
        EventRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for interacting with email tasks and their receivers.
    pub fn email_tasks(&self) -> EmailTaskRepository {
        EmailTaskRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for member records.
#[derive(Clone)]
pub struct MemberRepository {
    pool: SqlitePool,
}

impl MemberRepository {
    /// Inserts a single new member.
    pub async fn insert(&self, record: &NewMember<'_>) -> Result<(), MemberStoreError> {
        let mut tx = self.pool.begin().await?;
        insert_member(&mut tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Inserts a batch of members inside a single transaction.
    ///
    /// Either every record is persisted or none of them are.
    pub async fn insert_batch(&self, records: &[NewMember<'_>]) -> Result<(), MemberStoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            insert_member(&mut tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Loads a member by primary key.
    pub async fn fetch_by_id(&self, id: &str) -> Result<Option<Member>, MemberStoreError> {
        let row = sqlx::query_as::<_, MemberRow>(
            "SELECT id, name, email, student_id, department, batch, status, soft_deleted_at, created_at \
             FROM members WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(MemberRow::into_domain))
    }

    /// Loads the active member registered under the provided student id.
    pub async fn find_by_student_id(
        &self,
        student_id: &str,
    ) -> Result<Option<Member>, MemberStoreError> {
        let row = sqlx::query_as::<_, MemberRow>(
            "SELECT id, name, email, student_id, department, batch, status, soft_deleted_at, created_at \
             FROM members WHERE student_id = ? AND status = 'ACTIVE'",
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(MemberRow::into_domain))
    }

    /// Returns the subset of `student_ids` already registered by active members.
    pub async fn find_existing_student_ids(
        &self,
        student_ids: &[String],
    ) -> Result<Vec<String>, MemberStoreError> {
        if student_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; student_ids.len()].join(", ");
        let sql = format!(
            "SELECT student_id FROM members \
             WHERE status = 'ACTIVE' AND student_id IN ({placeholders}) \
             ORDER BY student_id"
        );

        let mut query = sqlx::query_scalar::<_, String>(&sql);
        for student_id in student_ids {
            query = query.bind(student_id);
        }

        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Lists the members matching the provided ids that belong to `batch`.
    pub async fn list_by_ids_and_batch(
        &self,
        ids: &[String],
        batch: &str,
    ) -> Result<Vec<Member>, MemberStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id, name, email, student_id, department, batch, status, soft_deleted_at, created_at \
             FROM members WHERE batch = ? AND id IN ({placeholders}) \
             ORDER BY created_at"
        );

        let mut query = sqlx::query_as::<_, MemberRow>(&sql).bind(batch);
        for id in ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(MemberRow::into_domain).collect())
    }

    /// Marks a member as withdrawn at the provided instant.
    pub async fn mark_deleted(
        &self,
        id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), MemberStoreError> {
        let result = sqlx::query(
            "UPDATE members SET status = 'DELETED', soft_deleted_at = ? WHERE id = ?",
        )
        .bind(to_rfc3339(deleted_at))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MemberStoreError::MissingMember);
        }

        Ok(())
    }
}

async fn insert_member(
    tx: &mut Transaction<'_, Sqlite>,
    record: &NewMember<'_>,
) -> Result<(), MemberStoreError> {
    sqlx::query(
        "INSERT INTO members \
         (id, name, email, student_id, department, batch, status, soft_deleted_at, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, 'ACTIVE', NULL, ?)",
    )
    .bind(record.id)
    .bind(record.name)
    .bind(record.email)
    .bind(record.student_id)
    .bind(record.department)
    .bind(record.batch)
    .bind(to_rfc3339(record.created_at))
    .execute(&mut **tx)
    .await
    .map_err(|err| match err {
        sqlx::Error::Database(db_err) => {
            if db_err.code().as_deref() == Some("2067") {
                MemberStoreError::DuplicateStudentId
            } else {
                MemberStoreError::Database(sqlx::Error::Database(db_err))
            }
        }
        other => MemberStoreError::Database(other),
    })?;

    Ok(())
}

/// Data required to persist a new member.
#[derive(Debug, Clone)]
pub struct NewMember<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub email: &'a str,
    pub student_id: &'a str,
    pub department: &'a str,
    pub batch: &'a str,
    pub created_at: DateTime<Utc>,
}

/// Errors that can occur while mutating member records.
#[derive(Debug, Error)]
pub enum MemberStoreError {
    #[error("an active member with the same student id already exists")]
    DuplicateStudentId,
    #[error("member row does not exist")]
    MissingMember,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for MemberStoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MemberRow {
    id: String,
    name: String,
    email: String,
    student_id: String,
    department: String,
    batch: String,
    status: String,
    soft_deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl MemberRow {
    fn into_domain(self) -> Member {
        let status = match self.status.as_str() {
            "DELETED" => MemberStatus::Deleted,
            _ => MemberStatus::Active,
        };
        Member {
            id: self.id,
            name: self.name,
            email: self.email,
            student_id: self.student_id,
            department: self.department,
            batch: self.batch,
            status,
            soft_deleted_at: self.soft_deleted_at,
            created_at: self.created_at,
        }
    }
}

/// Repository for club events.
#[derive(Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    /// Inserts a new event.
    pub async fn insert(&self, record: &NewEvent<'_>) -> Result<(), EventStoreError> {
        sqlx::query(
            "INSERT INTO events (id, title, location, start_at, end_at, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(record.title)
        .bind(record.location)
        .bind(to_rfc3339(record.start_at))
        .bind(to_rfc3339(record.end_at))
        .bind(to_rfc3339(record.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Lists events whose start time falls within the inclusive range.
    pub async fn list_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>, EventStoreError> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, title, location, start_at, end_at, created_at \
             FROM events WHERE start_at >= ? AND start_at <= ? \
             ORDER BY start_at",
        )
        .bind(to_rfc3339(start))
        .bind(to_rfc3339(end))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EventRow::into_domain).collect())
    }
}

/// Data required to persist a new event.
#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub location: Option<&'a str>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Errors that can occur while reading or writing events.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: String,
    title: String,
    location: Option<String>,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl EventRow {
    fn into_domain(self) -> Event {
        Event {
            id: self.id,
            title: self.title,
            location: self.location,
            start_at: self.start_at,
            end_at: self.end_at,
            created_at: self.created_at,
        }
    }
}

/// Repository for email tasks and their receivers.
#[derive(Clone)]
pub struct EmailTaskRepository {
    pool: SqlitePool,
}

impl EmailTaskRepository {
    /// Inserts a new email task.
    pub async fn insert_task(&self, record: &NewEmailTask<'_>) -> Result<(), EmailStoreError> {
        sqlx::query(
            "INSERT INTO email_tasks (id, subject, content, send_at, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(record.id)
        .bind(record.subject)
        .bind(record.content)
        .bind(to_rfc3339(record.send_at))
        .bind(to_rfc3339(record.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Inserts the receivers of a task inside a single transaction.
    pub async fn insert_receivers(
        &self,
        records: &[NewEmailReceiver<'_>],
    ) -> Result<(), EmailStoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                "INSERT INTO email_receivers \
                 (id, task_id, email, name, send_status, status_updated_at, sent_at) \
                 VALUES (?, ?, ?, ?, 'WAITING', ?, NULL)",
            )
            .bind(record.id)
            .bind(record.task_id)
            .bind(record.email)
            .bind(record.name)
            .bind(to_rfc3339(record.created_at))
            .execute(&mut *tx)
            .await
            .map_err(|err| match err {
                sqlx::Error::Database(db_err) => {
                    if db_err.code().as_deref() == Some("787") {
                        EmailStoreError::MissingTask
                    } else {
                        EmailStoreError::Database(sqlx::Error::Database(db_err))
                    }
                }
                other => EmailStoreError::Database(other),
            })?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Loads a task together with all of its receivers.
    pub async fn fetch_task_with_receivers(
        &self,
        task_id: &str,
    ) -> Result<EmailTaskInfo, EmailStoreError> {
        let task = sqlx::query_as::<_, EmailTaskRow>(
            "SELECT id, subject, content, send_at, created_at FROM email_tasks WHERE id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(EmailStoreError::MissingTask)?;

        let receivers = sqlx::query_as::<_, EmailReceiverRow>(
            "SELECT id, task_id, email, name, send_status, status_updated_at, sent_at \
             FROM email_receivers WHERE task_id = ? ORDER BY email",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(EmailTaskInfo {
            task: task.into_domain(),
            receivers: receivers
                .into_iter()
                .map(EmailReceiverRow::into_domain)
                .collect(),
        })
    }

    /// Lists tasks whose scheduled send time has passed.
    pub async fn list_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<EmailTask>, EmailStoreError> {
        let rows = sqlx::query_as::<_, EmailTaskRow>(
            "SELECT id, subject, content, send_at, created_at \
             FROM email_tasks WHERE send_at <= ? ORDER BY send_at",
        )
        .bind(to_rfc3339(now))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EmailTaskRow::into_domain).collect())
    }

    /// Persists the completed delivery of a single receiver.
    ///
    /// Receivers that already completed are left untouched.
    pub async fn mark_receiver_completed(
        &self,
        receiver_id: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), EmailStoreError> {
        sqlx::query(
            "UPDATE email_receivers \
             SET send_status = 'COMPLETED', status_updated_at = ?, sent_at = ? \
             WHERE id = ? AND send_status = 'WAITING'",
        )
        .bind(to_rfc3339(sent_at))
        .bind(to_rfc3339(sent_at))
        .bind(receiver_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Data required to persist a new email task.
#[derive(Debug, Clone)]
pub struct NewEmailTask<'a> {
    pub id: &'a str,
    pub subject: &'a str,
    pub content: &'a str,
    pub send_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Data required to persist a new email receiver.
#[derive(Debug, Clone)]
pub struct NewEmailReceiver<'a> {
    pub id: &'a str,
    pub task_id: &'a str,
    pub email: &'a str,
    pub name: &'a str,
    pub created_at: DateTime<Utc>,
}

/// Errors that can occur while reading or writing email tasks.
#[derive(Debug, Error)]
pub enum EmailStoreError {
    #[error("email task does not exist")]
    MissingTask,
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for EmailStoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EmailTaskRow {
    id: String,
    subject: String,
    content: String,
    send_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl EmailTaskRow {
    fn into_domain(self) -> EmailTask {
        EmailTask {
            id: self.id,
            subject: self.subject,
            content: self.content,
            send_at: self.send_at,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EmailReceiverRow {
    id: String,
    task_id: String,
    email: String,
    name: String,
    send_status: String,
    status_updated_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
}

impl EmailReceiverRow {
    fn into_domain(self) -> EmailReceiver {
        let send_status = match self.send_status.as_str() {
            "COMPLETED" => EmailSendStatus::Completed,
            _ => EmailSendStatus::Waiting,
        };
        EmailReceiver {
            id: self.id,
            task_id: self.task_id,
            email: self.email,
            name: self.name,
            send_status,
            status_updated_at: self.status_updated_at,
            sent_at: self.sent_at,
        }
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
