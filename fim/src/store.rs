//! Baseline persistence: a single key/value table in SQLite holding JSON values.

use std::fs::{DirBuilder, OpenOptions, Permissions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use log::debug;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::consumer::access::Access;
use crate::consumer::users::Users;
use crate::error::FimError;

const USERS_KEY: &str = "users";
const ACCESS_KEY: &str = "access";

/// Typed save/load of the baselines. Loading from an empty store yields an
/// empty value.
pub trait Store: Send + Sync {
    fn save_users(&self, users: &Users) -> Result<(), FimError>;
    fn load_users(&self) -> Result<Users, FimError>;
    fn save_access(&self, access: &Access) -> Result<(), FimError>;
    fn load_access(&self) -> Result<Access, FimError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// The database and any directory created for it are private to the owner.
    pub fn open(db_path: &Path) -> Result<Self, FimError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .map_err(|e| FimError::io(parent, e))?;
        }
        OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o600)
            .open(db_path)
            .map_err(|e| FimError::io(db_path, e))?;
        // an existing database keeps its old mode unless tightened here
        std::fs::set_permissions(db_path, Permissions::from_mode(0o600))
            .map_err(|e| FimError::io(db_path, e))?;
        let store = Self {
            conn: Mutex::new(Connection::open(db_path)?),
        };
        store.init_schema()?;
        debug!("baseline store at {}", db_path.display());
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, FimError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), FimError> {
        self.conn.lock().execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), FimError> {
        let value = serde_json::to_string(value)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn get<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, FimError> {
        let value: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            Some(value) => Ok(serde_json::from_str(&value)?),
            None => Ok(T::default()),
        }
    }
}

impl Store for SqliteStore {
    fn save_users(&self, users: &Users) -> Result<(), FimError> {
        self.put(USERS_KEY, users)
    }

    fn load_users(&self) -> Result<Users, FimError> {
        self.get(USERS_KEY)
    }

    fn save_access(&self, access: &Access) -> Result<(), FimError> {
        self.put(ACCESS_KEY, access)
    }

    fn load_access(&self) -> Result<Access, FimError> {
        self.get(ACCESS_KEY)
    }
}
