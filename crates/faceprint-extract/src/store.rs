//! SQLite access for `users` and `face_images`.
//!
//! Embeddings are stored as JSON text: one array of floats per image, one
//! array of arrays per user.

use crate::config::DatabaseConfig;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database not found: {0}")]
    DatabaseNotFound(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A user with at least one uploaded face image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRef {
    pub id: i64,
    pub name: String,
}

/// One uploaded face image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: i64,
    pub image_url: String,
    pub created_at: String,
}

impl ImageRecord {
    /// Base file name of the stored reference (`/uploads/faces/a.jpg` → `a.jpg`).
    pub fn file_name(&self) -> Option<&str> {
        let name = self.image_url.rsplit(['/', '\\']).next()?;
        let name = name.split(['?', '#']).next()?;
        (!name.is_empty()).then_some(name)
    }
}

/// Read-only embedding status of one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStatus {
    pub user: UserRef,
    /// Number of aggregate vectors on the user record, `None` when unset.
    pub stored_vectors: Option<usize>,
    /// Length of the stored vectors, `None` when unset.
    pub stored_dimension: Option<usize>,
    pub image_count: usize,
    pub last_upload: Option<String>,
}

impl UserStatus {
    /// Whether the stored vectors were produced with a different dimension than `expected`.
    pub fn dimension_differs(&self, expected: usize) -> bool {
        self.stored_dimension.is_some_and(|d| d != expected)
    }
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open the database described by the connection settings.
    pub fn connect(database: &DatabaseConfig) -> Result<Self, StoreError> {
        if !database.user.is_empty() || !database.password.is_empty() {
            tracing::debug!(user = %database.user, "SQLite store does not authenticate; credentials ignored");
        }
        let store = Self::open(&database.path())?;
        tracing::info!(host = %database.host, port = database.port, name = %database.name, "connected");
        Ok(store)
    }

    /// Open an existing database read-write. A missing file is an error, not a new database.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Err(StoreError::DatabaseNotFound(path.display().to_string()));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // Fail at startup if either table is unusable
        conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get::<_, i64>(0))?;
        conn.query_row("SELECT COUNT(*) FROM face_images", [], |row| row.get::<_, i64>(0))?;

        tracing::info!(path = %path.display(), "database opened");
        Ok(Self { conn })
    }

    /// Users owning at least one image, by ascending id; only `target` when given.
    pub fn candidate_users(&self, target: Option<i64>) -> Result<Vec<UserRef>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT fi.user_id, COALESCE(u.name, '')
             FROM face_images fi
             JOIN users u ON fi.user_id = u.id
             WHERE ?1 IS NULL OR fi.user_id = ?1
             ORDER BY fi.user_id",
        )?;
        let users = stmt
            .query_map(params![target], |row| {
                Ok(UserRef { id: row.get(0)?, name: row.get(1)? })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// A user's images in upload order.
    pub fn user_images(&self, user_id: i64) -> Result<Vec<ImageRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, image_url, created_at
             FROM face_images
             WHERE user_id = ?1
             ORDER BY created_at, id",
        )?;
        let images = stmt
            .query_map(params![user_id], |row| {
                Ok(ImageRecord {
                    id: row.get(0)?,
                    image_url: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(images)
    }

    /// Dimension of the vectors currently stored on a user, if any can be read.
    pub fn stored_dimension(&self, user_id: i64) -> Result<Option<usize>, StoreError> {
        let stored = self.stored_embeddings(user_id)?;
        Ok(stored.and_then(|vectors| vectors.first().map(Vec::len)))
    }

    pub fn user_status(&self, user: &UserRef) -> Result<UserStatus, StoreError> {
        let stored = self.stored_embeddings(user.id)?;
        let stored_vectors = stored.as_ref().map(Vec::len);
        let stored_dimension = stored.as_ref().and_then(|vectors| vectors.first()).map(Vec::len);
        let (image_count, last_upload) = self.conn.query_row(
            "SELECT COUNT(*), MAX(created_at) FROM face_images WHERE user_id = ?1",
            params![user.id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
        )?;

        Ok(UserStatus {
            user: user.clone(),
            stored_vectors,
            stored_dimension,
            image_count: image_count as usize,
            last_upload,
        })
    }

    fn stored_embeddings(&self, user_id: i64) -> Result<Option<Vec<Vec<f32>>>, StoreError> {
        let text: Option<String> = self
            .conn
            .query_row(
                "SELECT face_embeddings FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        Ok(text.and_then(|t| match serde_json::from_str(&t) {
            Ok(vectors) => Some(vectors),
            Err(e) => {
                tracing::debug!(user_id, error = %e, "stored face_embeddings not readable as vectors");
                None
            }
        }))
    }

    /// Open the write scope for one user.
    pub fn begin_user(&mut self) -> Result<UserBatch<'_>, StoreError> {
        Ok(UserBatch { tx: self.conn.transaction()? })
    }
}

/// All writes for one user, committed or rolled back together.
///
/// Dropping a batch without calling [`commit`](Self::commit) rolls it back.
pub struct UserBatch<'conn> {
    tx: Transaction<'conn>,
}

impl UserBatch<'_> {
    /// Overwrite one image's embedding.
    pub fn set_image_embedding(&self, image_id: i64, values: &[f32]) -> Result<(), StoreError> {
        let json = serde_json::to_string(values)?;
        self.tx.execute(
            "UPDATE face_images SET embedding = ?1 WHERE id = ?2",
            params![json, image_id],
        )?;
        Ok(())
    }

    /// Replace a user's aggregate vectors and bump `updated_at`.
    pub fn replace_user_embeddings(
        &self,
        user_id: i64,
        vectors: &[Vec<f32>],
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(vectors)?;
        self.tx.execute(
            "UPDATE users SET face_embeddings = ?1, updated_at = ?2 WHERE id = ?3",
            params![json, updated_at.format("%Y-%m-%d %H:%M:%S").to_string(), user_id],
        )?;
        Ok(())
    }

    pub fn commit(self) -> Result<(), StoreError> {
        self.tx.commit()?;
        Ok(())
    }

    pub fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback()?;
        Ok(())
    }
}

/// In-memory database with the production schema, for tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    const SCHEMA: &str = "
        CREATE TABLE users (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            face_embeddings TEXT,
            updated_at TEXT
        );
        CREATE TABLE face_images (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL REFERENCES users(id),
            image_url TEXT NOT NULL,
            embedding TEXT,
            created_at TEXT NOT NULL
        );
    ";

    /// Database file with the schema, one user (id 1) and one image (`face.jpg`).
    pub fn create_database(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn.execute("INSERT INTO users (id, name) VALUES (1, 'One')", []).unwrap();
        conn.execute(
            "INSERT INTO face_images (id, user_id, image_url, created_at)
             VALUES (10, 1, '/uploads/faces/face.jpg', '2024-01-01 00:00:00')",
            [],
        )
        .unwrap();
    }

    pub fn store() -> Store {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        Store { conn }
    }

    pub fn add_user(store: &Store, id: i64, name: &str) {
        store
            .conn
            .execute("INSERT INTO users (id, name) VALUES (?1, ?2)", params![id, name])
            .unwrap();
    }

    pub fn add_image(store: &Store, id: i64, user_id: i64, image_url: &str, created_at: &str) {
        store
            .conn
            .execute(
                "INSERT INTO face_images (id, user_id, image_url, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, user_id, image_url, created_at],
            )
            .unwrap();
    }

    pub fn set_user_row(store: &Store, id: i64, face_embeddings: &str, updated_at: &str) {
        store
            .conn
            .execute(
                "UPDATE users SET face_embeddings = ?1, updated_at = ?2 WHERE id = ?3",
                params![face_embeddings, updated_at, id],
            )
            .unwrap();
    }

    /// `(face_embeddings, updated_at)` as stored.
    pub fn user_row(store: &Store, id: i64) -> (Option<String>, Option<String>) {
        store
            .conn
            .query_row(
                "SELECT face_embeddings, updated_at FROM users WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap()
    }

    pub fn user_vectors(store: &Store, id: i64) -> Vec<Vec<f32>> {
        let text = user_row(store, id).0.expect("face_embeddings set");
        serde_json::from_str(&text).unwrap()
    }

    pub fn image_embedding(store: &Store, id: i64) -> Option<String> {
        store
            .conn
            .query_row("SELECT embedding FROM face_images WHERE id = ?1", params![id], |row| row.get(0))
            .unwrap()
    }

    /// Make every write to `users` for `user_id` fail.
    pub fn fail_user_updates(store: &Store, user_id: i64) {
        store
            .conn
            .execute_batch(&format!(
                "CREATE TRIGGER fail_user_{user_id} BEFORE UPDATE ON users
                 WHEN NEW.id = {user_id}
                 BEGIN SELECT RAISE(ABORT, 'users row locked'); END;"
            ))
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use std::path::PathBuf;

    fn image(url: &str) -> ImageRecord {
        ImageRecord { id: 1, image_url: url.into(), created_at: String::new() }
    }

    #[test]
    fn test_file_name_from_url() {
        assert_eq!(image("/uploads/faces/face-1.jpg").file_name(), Some("face-1.jpg"));
        assert_eq!(image("https://cdn.example.com/faces/a.png?v=2").file_name(), Some("a.png"));
        assert_eq!(image("b.jpeg").file_name(), Some("b.jpeg"));
        assert_eq!(image("C:\\uploads\\faces\\c.jpg").file_name(), Some("c.jpg"));
        assert_eq!(image("/uploads/faces/").file_name(), None);
    }

    #[test]
    fn test_open_missing_database() {
        let dir = tempfile::tempdir().unwrap();
        let err = Store::open(&dir.path().join("missing.db")).err().unwrap();
        assert!(matches!(err, StoreError::DatabaseNotFound(_)));
        assert!(!dir.path().join("missing.db").exists());
    }

    fn database(file: Option<PathBuf>) -> DatabaseConfig {
        DatabaseConfig {
            host: "localhost".into(),
            port: 5432,
            name: "tia_db".into(),
            user: "postgres".into(),
            password: "postgres".into(),
            file,
        }
    }

    #[test]
    fn test_connect_opens_configured_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        create_database(&path);

        let store = Store::connect(&database(Some(path))).unwrap();
        let users = store.candidate_users(None).unwrap();
        assert_eq!(users, vec![UserRef { id: 1, name: "One".into() }]);
    }

    #[test]
    fn test_connect_missing_named_database() {
        let err = Store::connect(&database(None)).err().unwrap();
        assert!(matches!(err, StoreError::DatabaseNotFound(p) if p.ends_with("tia_db.db")));
    }

    #[test]
    fn test_open_without_schema_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.db");
        Connection::open(&path).unwrap().execute_batch("PRAGMA user_version = 1;").unwrap();
        assert!(matches!(Store::open(&path), Err(StoreError::Sqlite(_))));
    }

    #[test]
    fn test_candidate_users_ordered_and_distinct() {
        let store = store();
        add_user(&store, 9, "Nine");
        add_user(&store, 3, "Three");
        add_user(&store, 5, "No Images");
        add_image(&store, 1, 9, "a.jpg", "2024-01-01 00:00:00");
        add_image(&store, 2, 3, "b.jpg", "2024-01-01 00:00:00");
        add_image(&store, 3, 9, "c.jpg", "2024-01-02 00:00:00");

        let users = store.candidate_users(None).unwrap();
        let ids: Vec<i64> = users.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![3, 9]);
        assert_eq!(users[0].name, "Three");
    }

    #[test]
    fn test_candidate_users_target() {
        let store = store();
        add_user(&store, 1, "One");
        add_user(&store, 2, "Two");
        add_image(&store, 1, 1, "a.jpg", "2024-01-01 00:00:00");
        add_image(&store, 2, 2, "b.jpg", "2024-01-01 00:00:00");

        let users = store.candidate_users(Some(2)).unwrap();
        assert_eq!(users, vec![UserRef { id: 2, name: "Two".into() }]);
        assert!(store.candidate_users(Some(77)).unwrap().is_empty());
    }

    #[test]
    fn test_user_images_by_creation_time() {
        let store = store();
        add_user(&store, 1, "One");
        add_image(&store, 10, 1, "late.jpg", "2024-03-01 10:00:00");
        add_image(&store, 11, 1, "early.jpg", "2024-01-01 10:00:00");
        add_image(&store, 12, 1, "mid.jpg", "2024-02-01 10:00:00");

        let urls: Vec<String> = store.user_images(1).unwrap().into_iter().map(|i| i.image_url).collect();
        assert_eq!(urls, vec!["early.jpg", "mid.jpg", "late.jpg"]);
    }

    #[test]
    fn test_batch_commit_writes_both_tables() {
        let mut store = store();
        add_user(&store, 1, "One");
        add_image(&store, 10, 1, "a.jpg", "2024-01-01 00:00:00");

        let at = DateTime::parse_from_rfc3339("2024-05-06T07:08:09Z").unwrap().with_timezone(&Utc);
        let batch = store.begin_user().unwrap();
        batch.set_image_embedding(10, &[0.5, -0.25]).unwrap();
        batch.replace_user_embeddings(1, &[vec![0.5, -0.25]], at).unwrap();
        batch.commit().unwrap();

        assert_eq!(image_embedding(&store, 10).as_deref(), Some("[0.5,-0.25]"));
        let (vectors, updated_at) = user_row(&store, 1);
        assert_eq!(vectors.as_deref(), Some("[[0.5,-0.25]]"));
        assert_eq!(updated_at.as_deref(), Some("2024-05-06 07:08:09"));
    }

    #[test]
    fn test_batch_rollback_discards_writes() {
        let mut store = store();
        add_user(&store, 1, "One");
        add_image(&store, 10, 1, "a.jpg", "2024-01-01 00:00:00");

        let batch = store.begin_user().unwrap();
        batch.set_image_embedding(10, &[1.0]).unwrap();
        batch.rollback().unwrap();

        assert_eq!(image_embedding(&store, 10), None);
    }

    #[test]
    fn test_batch_dropped_rolls_back() {
        let mut store = store();
        add_user(&store, 1, "One");
        add_image(&store, 10, 1, "a.jpg", "2024-01-01 00:00:00");

        {
            let batch = store.begin_user().unwrap();
            batch.set_image_embedding(10, &[1.0]).unwrap();
        }

        assert_eq!(image_embedding(&store, 10), None);
    }

    #[test]
    fn test_stored_dimension_and_status() {
        let store = store();
        add_user(&store, 1, "One");
        add_user(&store, 2, "Two");
        add_image(&store, 10, 1, "a.jpg", "2024-01-01 00:00:00");
        add_image(&store, 11, 1, "b.jpg", "2024-02-01 00:00:00");
        set_user_row(&store, 1, "[[0.1,0.2,0.3],[0.4,0.5,0.6]]", "2024-02-02 00:00:00");

        assert_eq!(store.stored_dimension(1).unwrap(), Some(3));
        assert_eq!(store.stored_dimension(2).unwrap(), None);

        let status = store.user_status(&UserRef { id: 1, name: "One".into() }).unwrap();
        assert_eq!(status.stored_vectors, Some(2));
        assert_eq!(status.stored_dimension, Some(3));
        assert!(status.dimension_differs(128));
        assert!(!status.dimension_differs(3));
        assert_eq!(status.image_count, 2);
        assert_eq!(status.last_upload.as_deref(), Some("2024-02-01 00:00:00"));

        let status = store.user_status(&UserRef { id: 2, name: "Two".into() }).unwrap();
        assert_eq!(status.stored_vectors, None);
        assert!(!status.dimension_differs(192));
        assert_eq!(status.image_count, 0);
        assert_eq!(status.last_upload, None);
    }

    #[test]
    fn test_unreadable_stored_embeddings_ignored() {
        let store = store();
        add_user(&store, 1, "One");
        set_user_row(&store, 1, "not json", "2024-01-01 00:00:00");
        assert_eq!(store.stored_dimension(1).unwrap(), None);
    }

    #[test]
    fn test_failing_trigger_surfaces_error() {
        let mut store = store();
        add_user(&store, 1, "One");
        fail_user_updates(&store, 1);

        let batch = store.begin_user().unwrap();
        let err = batch.replace_user_embeddings(1, &[vec![1.0]], Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
    }
}
