use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::{Database, NativeDatabase, Row, SqlValue, StorageError};

/// Named slots the SDK persists between launches.
pub mod keys {
    pub const CURRENT_USER_ID: &str = "Sabycom.CurrentUserId";
    pub const ANONYMOUS_USER: &str = "Sabycom.AnonymousUser";
    pub const USER_INFO_SENT: &str = "Sabycom.UserInfoSent";
    pub const APP_ID: &str = "SabycomConfigurationInteractor.CurrentAppId";
    pub const HOST: &str = "SabycomConfigurationInteractor.CurrentHost";
    pub const LAST_USED_URL: &str = "SabycomWidget.LastUsedURL";
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("value for {key} is not text")]
    NotText { key: String },
}

/// Get/set/delete over single named string slots.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

pub struct SqliteKeyValueStore {
    db: Arc<NativeDatabase>,
}

impl SqliteKeyValueStore {
    pub fn new(db: Arc<NativeDatabase>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let k = key.to_string();
        let rows: Vec<Row> = self
            .db
            .query("SELECT value FROM kv_store WHERE key = ?1", &[&k])
            .await?;

        match rows.first().and_then(|row| row.get(0)) {
            Some(SqlValue::Text(text)) => Ok(Some(text.clone())),
            Some(SqlValue::Null) | None => Ok(None),
            Some(_) => Err(KvError::NotText { key: k }),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let k = key.to_string();
        let val = value.to_string();
        self.db
            .execute(
                "INSERT INTO kv_store (key, value) VALUES (?1, ?2) \
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                &[&k, &val],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let k = key.to_string();
        self.db
            .execute("DELETE FROM kv_store WHERE key = ?1", &[&k])
            .await?;
        Ok(())
    }
}

/// Process-local store for ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.values.read().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.values
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.values.write().unwrap().remove(key);
        Ok(())
    }
}
