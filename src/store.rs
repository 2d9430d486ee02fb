use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    FromRow,
};
use std::str::FromStr;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::pipeline::ClassificationResult;

/// Notifications returned per request.
pub const NOTIFICATION_LIMIT: i64 = 10;

const CREATE_PREDICTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS predictions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    diagnosis TEXT NOT NULL,
    confidence REAL NOT NULL,
    image_name TEXT NOT NULL,
    created_at TEXT NOT NULL
)"#;

const CREATE_NOTIFICATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS notifications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
)"#;

const CREATE_USERS: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    name TEXT,
    phone TEXT,
    created_at TEXT NOT NULL,
    last_login TEXT
)"#;

const USER_COLUMNS: &str = "id, email, password_hash, name, phone, created_at, last_login";

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub created_at: String,
    pub last_login: Option<String>,
}

/// Profile fields to change; `None` leaves a field as it is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct PredictionRecord {
    pub id: i64,
    pub diagnosis: String,
    pub confidence: f64,
    pub image_name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Notification {
    pub id: i64,
    pub message: String,
    #[serde(rename = "timestamp")]
    pub created_at: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("email already registered")]
    EmailTaken,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to format timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// Accounts, prediction history and notifications.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens the database at `url` and creates missing tables.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool_options = if url.contains(":memory:") {
            // An in-memory database only lives as long as its one connection.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(CREATE_USERS).execute(&pool).await?;
        sqlx::query(CREATE_PREDICTIONS).execute(&pool).await?;
        sqlx::query(CREATE_NOTIFICATIONS).execute(&pool).await?;

        tracing::info!("Database ready");
        Ok(Self { pool })
    }

    pub async fn create_user(&self, email: &str, password_hash: &str) -> Result<User, StoreError> {
        let created_at = now()?;
        let inserted = sqlx::query(
            "INSERT INTO users (email, password_hash, created_at) VALUES (?, ?, ?)",
        )
        .bind(email)
        .bind(password_hash)
        .bind(&created_at)
        .execute(&self.pool)
        .await;

        let id = match inserted {
            Ok(done) => done.last_insert_rowid(),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                return Err(StoreError::EmailTaken)
            }
            Err(err) => return Err(err.into()),
        };

        Ok(User {
            id,
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            name: None,
            phone: None,
            created_at,
            last_login: None,
        })
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = ?"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn user_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn record_login(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
            .bind(now()?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Applies `update` and returns the updated user, or `None` when no such
    /// user exists.
    pub async fn update_profile(
        &self,
        id: i64,
        update: &ProfileUpdate,
    ) -> Result<Option<User>, StoreError> {
        let affected = sqlx::query(
            "UPDATE users SET name = COALESCE(?, name), phone = COALESCE(?, phone) WHERE id = ?",
        )
        .bind(update.name.as_deref())
        .bind(update.phone.as_deref())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Ok(None);
        }
        self.user_by_id(id).await
    }

    /// Stores the prediction and its "new prediction" notification in one
    /// transaction; either both rows are written or neither is.
    pub async fn record_prediction(
        &self,
        user_id: &str,
        result: &ClassificationResult,
        image_name: &str,
    ) -> Result<PredictionRecord, StoreError> {
        let created_at = now()?;
        let diagnosis = result.label.to_string();

        let mut tx = self.pool.begin().await?;

        let id = sqlx::query(
            "INSERT INTO predictions (user_id, diagnosis, confidence, image_name, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(&diagnosis)
        .bind(result.confidence)
        .bind(image_name)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        sqlx::query("INSERT INTO notifications (user_id, message, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(format!("New prediction available: {diagnosis}"))
            .bind(&created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(PredictionRecord {
            id,
            diagnosis,
            confidence: result.confidence,
            image_name: image_name.to_string(),
            created_at,
        })
    }

    /// Newest first.
    pub async fn history(&self, user_id: &str) -> Result<Vec<PredictionRecord>, StoreError> {
        let records = sqlx::query_as::<_, PredictionRecord>(
            "SELECT id, diagnosis, confidence, image_name, created_at FROM predictions \
             WHERE user_id = ? ORDER BY id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// The latest [`NOTIFICATION_LIMIT`] notifications, newest first.
    pub async fn notifications(&self, user_id: &str) -> Result<Vec<Notification>, StoreError> {
        let notifications = sqlx::query_as::<_, Notification>(
            "SELECT id, message, created_at FROM notifications \
             WHERE user_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(NOTIFICATION_LIMIT)
        .fetch_all(&self.pool)
        .await?;
        Ok(notifications)
    }
}

fn now() -> Result<String, time::error::Format> {
    OffsetDateTime::now_utc().format(&Rfc3339)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{Diagnosis, Disease};

    async fn memory_store() -> Store {
        Store::connect("sqlite::memory:").await.unwrap()
    }

    fn result(label: Diagnosis, confidence: f64) -> ClassificationResult {
        ClassificationResult { label, confidence }
    }

    #[tokio::test]
    async fn history_is_per_user_and_newest_first() {
        let store = memory_store().await;
        store
            .record_prediction("alice", &result(Diagnosis::Known(Disease::Normal), 91.5), "a.png")
            .await
            .unwrap();
        store
            .record_prediction("bob", &result(Diagnosis::Known(Disease::Edema), 55.0), "b.png")
            .await
            .unwrap();
        store
            .record_prediction("alice", &result(Diagnosis::Unknown, 12.25), "c.jpg")
            .await
            .unwrap();

        let history = store.history("alice").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].diagnosis, "Unknown");
        assert_eq!(history[0].image_name, "c.jpg");
        assert_eq!(history[1].diagnosis, "Normal");
        assert_eq!(history[1].confidence, 91.5);
        assert!(OffsetDateTime::parse(&history[0].created_at, &Rfc3339).is_ok());
    }

    #[tokio::test]
    async fn prediction_writes_a_notification() {
        let store = memory_store().await;
        store
            .record_prediction("alice", &result(Diagnosis::Known(Disease::Edema), 64.0), "a.png")
            .await
            .unwrap();

        let notifications = store.notifications("alice").await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].message, "New prediction available: Edema");
    }

    #[tokio::test]
    async fn failed_notification_rolls_back_prediction() {
        let store = memory_store().await;
        sqlx::query("DROP TABLE notifications")
            .execute(&store.pool)
            .await
            .unwrap();

        let outcome = store
            .record_prediction("alice", &result(Diagnosis::Known(Disease::Normal), 80.0), "a.png")
            .await;
        assert!(outcome.is_err());
        assert!(store.history("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn notifications_are_capped() {
        let store = memory_store().await;
        for i in 0..12 {
            sqlx::query("INSERT INTO notifications (user_id, message, created_at) VALUES (?, ?, ?)")
                .bind("alice")
                .bind(format!("message {i}"))
                .bind(now().unwrap())
                .execute(&store.pool)
                .await
                .unwrap();
        }

        let notifications = store.notifications("alice").await.unwrap();
        assert_eq!(notifications.len(), NOTIFICATION_LIMIT as usize);
        assert_eq!(notifications[0].message, "message 11");
        assert_eq!(notifications[9].message, "message 2");
        assert!(store.notifications("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let store = memory_store().await;
        let user = store.create_user("a@example.com", "hash").await.unwrap();
        assert_eq!(user.email, "a@example.com");

        assert!(matches!(
            store.create_user("a@example.com", "other").await,
            Err(StoreError::EmailTaken)
        ));
        let found = store.user_by_email("a@example.com").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.password_hash, "hash");
    }

    #[tokio::test]
    async fn profile_update_keeps_unset_fields() {
        let store = memory_store().await;
        let user = store.create_user("a@example.com", "hash").await.unwrap();

        let update = ProfileUpdate {
            name: Some("Jane".into()),
            phone: Some("+123456789".into()),
        };
        store.update_profile(user.id, &update).await.unwrap();

        let update = ProfileUpdate {
            name: Some("Jane Doe".into()),
            phone: None,
        };
        let updated = store.update_profile(user.id, &update).await.unwrap().unwrap();
        assert_eq!(updated.name.as_deref(), Some("Jane Doe"));
        assert_eq!(updated.phone.as_deref(), Some("+123456789"));

        assert_eq!(store.update_profile(999, &update).await.unwrap(), None);
    }

    #[tokio::test]
    async fn login_is_timestamped() {
        let store = memory_store().await;
        let user = store.create_user("a@example.com", "hash").await.unwrap();
        store.record_login(user.id).await.unwrap();
        let user = store.user_by_id(user.id).await.unwrap().unwrap();
        assert!(user.last_login.is_some());
    }
}
