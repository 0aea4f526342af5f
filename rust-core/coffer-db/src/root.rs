// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The persistent root mapping.
//
// Root entries are JSON documents stored under the `root:` namespace of
// the engine. Reads go through the connection, so they see the current
// transaction's uncommitted writes; writes are buffered until commit.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::connection::Connection;
use crate::error::{DbError, DbResult};

const ROOT_PREFIX: &str = "root:";

/// Key/value view over the application's persistent root.
#[derive(Debug, Clone)]
pub struct RootMapping {
    conn: Connection,
}

impl RootMapping {
    pub(crate) fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn object_key(key: &str) -> String {
        format!("{ROOT_PREFIX}{key}")
    }

    fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> DbResult<T> {
        serde_json::from_slice(bytes).map_err(|source| DbError::Serialization {
            key: key.to_string(),
            source,
        })
    }

    pub async fn contains_key(&self, key: &str) -> DbResult<bool> {
        Ok(self.conn.load(&Self::object_key(key)).await?.is_some())
    }

    /// Read an entry and deserialize it as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        match self.conn.load(&Self::object_key(key)).await? {
            Some(bytes) => Self::decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub async fn get_value(&self, key: &str) -> DbResult<Option<Value>> {
        self.get(key).await
    }

    /// Set an entry. The value is serialized now and written at commit.
    pub fn insert<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> DbResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|source| DbError::Serialization {
            key: key.to_string(),
            source,
        })?;
        self.conn.store(&Self::object_key(key), bytes)
    }

    pub fn insert_value(&self, key: &str, value: Value) -> DbResult<()> {
        self.insert(key, &value)
    }

    /// Delete an entry. Returns whether it existed.
    pub async fn remove(&self, key: &str) -> DbResult<bool> {
        let existed = self.contains_key(key).await?;
        if existed {
            self.conn.delete(&Self::object_key(key))?;
        }
        Ok(existed)
    }

    /// All keys, sorted.
    pub async fn keys(&self) -> DbResult<Vec<String>> {
        let rows = self.conn.scan(ROOT_PREFIX).await?;
        Ok(rows
            .into_keys()
            .map(|k| k[ROOT_PREFIX.len()..].to_string())
            .collect())
    }

    /// All entries, sorted by key.
    pub async fn entries(&self) -> DbResult<Vec<(String, Value)>> {
        let rows = self.conn.scan(ROOT_PREFIX).await?;
        rows.into_iter()
            .map(|(k, bytes)| {
                let key = k[ROOT_PREFIX.len()..].to_string();
                let value = Self::decode(&key, &bytes)?;
                Ok((key, value))
            })
            .collect()
    }

    pub async fn len(&self) -> DbResult<usize> {
        Ok(self.conn.scan(ROOT_PREFIX).await?.len())
    }

    pub async fn is_empty(&self) -> DbResult<bool> {
        Ok(self.len().await? == 0)
    }
}
