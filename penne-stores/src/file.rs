// Copyright 2025 Penne Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! File-backed checkpoint store.
//!
//! The checkpoint lives in a single file holding canonical Extended JSON:
//!
//! ```text
//! {"version":1,"token":{"_data":"8264A1B2C3000000012B..."}}
//! ```
//!
//! Every persist writes `<path>.tmp`, syncs it, renames it over `<path>` and
//! syncs the parent directory, so a crash leaves either the previous token
//! or the new one on disk.
//!
//! Files holding a bare token document (no envelope) are also accepted, which
//! keeps resume files written by earlier relays usable.

use bson::Bson;
use penne_core::checkpoint::{CheckpointError, CheckpointStore, CheckpointToken};
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Envelope format version.
const FORMAT_VERSION: i64 = 1;

/// Checkpoint store backed by one local file.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    tmp_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Creates a store for `path`. Nothing is touched until the first call.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut tmp: OsString = path.as_os_str().to_owned();
        tmp.push(".tmp");

        Self {
            path,
            tmp_path: PathBuf::from(tmp),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the checkpoint file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Encodes a token into the on-disk envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Serialization`] if the JSON cannot be rendered.
    pub fn encode(token: &CheckpointToken) -> Result<Vec<u8>, CheckpointError> {
        let envelope = serde_json::json!({
            "version": FORMAT_VERSION,
            "token": Bson::Document(token.as_document().clone()).into_canonical_extjson(),
        });
        serde_json::to_vec(&envelope)
            .map_err(|e| CheckpointError::Serialization(format!("failed to encode checkpoint: {e}")))
    }

    /// Decodes file contents. Blank contents mean no checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Corrupted`] for anything that is not a
    /// version 1 envelope or a bare token document.
    pub fn decode(bytes: &[u8]) -> Result<Option<CheckpointToken>, CheckpointError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| CheckpointError::Corrupted(format!("not valid JSON: {e}")))?;

        let token_json = match value {
            serde_json::Value::Object(mut map) if map.contains_key("version") => {
                let version = map.get("version").and_then(serde_json::Value::as_i64);
                if version != Some(FORMAT_VERSION) {
                    return Err(CheckpointError::Corrupted(format!(
                        "unsupported checkpoint version {:?}",
                        map.get("version")
                    )));
                }
                map.remove("token")
                    .ok_or_else(|| CheckpointError::Corrupted("envelope has no token".to_string()))?
            }
            other => other,
        };

        match Bson::try_from(token_json) {
            Ok(Bson::Document(doc)) => Ok(Some(CheckpointToken::new(doc))),
            Ok(other) => Err(CheckpointError::Corrupted(format!(
                "token must be a document, found {:?}",
                other.element_type()
            ))),
            Err(e) => Err(CheckpointError::Corrupted(format!("invalid Extended JSON: {e}"))),
        }
    }

    fn write_atomically(path: &Path, tmp_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        {
            let mut file = std::fs::File::create(tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }

        std::fs::rename(tmp_path, path)?;

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        // Directories cannot be opened for syncing on every platform.
        if let Ok(dir) = std::fs::File::open(parent) {
            if let Err(e) = dir.sync_all() {
                debug!(error = %e, "Directory sync not supported");
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn persist(&self, token: &CheckpointToken) -> Result<(), CheckpointError> {
        let bytes = Self::encode(token)?;
        let _guard = self.write_lock.lock().await;

        let path = self.path.clone();
        let tmp_path = self.tmp_path.clone();
        tokio::task::spawn_blocking(move || Self::write_atomically(&path, &tmp_path, &bytes))
            .await
            .map_err(|e| CheckpointError::Other(format!("checkpoint write task failed: {e}")))??;

        debug!(path = %self.path.display(), "Checkpoint written");
        Ok(())
    }

    async fn load(&self) -> Result<Option<CheckpointToken>, CheckpointError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No checkpoint file");
                return Ok(None);
            }
            Err(e) => return Err(CheckpointError::Io(e)),
        };

        let token = Self::decode(&bytes).inspect_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Checkpoint file cannot be used");
        })?;
        Ok(token)
    }

    async fn clear(&self) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().await;
        for path in [&self.path, &self.tmp_path] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CheckpointError::Io(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId, DateTime};
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> FileCheckpointStore {
        FileCheckpointStore::new(dir.path().join(".mongo_resume_token.ejson"))
    }

    #[tokio::test]
    async fn test_missing_file_means_no_checkpoint() {
        let dir = TempDir::new().unwrap();
        assert!(store_in(&dir).load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_file_means_no_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "  \n").unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_then_load_keeps_types() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let token = CheckpointToken::new(doc! {
            "_data": "8264A1B2C3000000012B022C0100296E5A1004",
            "txn": 42_i64,
            "small": 7_i32,
            "oid": ObjectId::parse_str("65a1b2c3d4e5f60718293a4b").unwrap(),
            "at": DateTime::from_millis(1_700_000_000_123),
        });

        store.persist(&token).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(token));
        assert!(!store.tmp_path.exists());
    }

    #[tokio::test]
    async fn test_persist_replaces_previous_token() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.persist(&CheckpointToken::log_position("binlog.000001", 4)).await.unwrap();
        store.persist(&CheckpointToken::log_position("binlog.000002", 120)).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.as_log_position(), Some(("binlog.000002", 120)));
    }

    #[tokio::test]
    async fn test_file_is_canonical_envelope() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.persist(&CheckpointToken::log_position("binlog.000001", 4)).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["token"]["file"], "binlog.000001");
        assert_eq!(json["token"]["position"]["$numberLong"], "4");
    }

    #[tokio::test]
    async fn test_garbage_is_corrupted_not_ignored() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "{\"_data\": ").unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupted(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unknown_version_is_corrupted() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), r#"{"version": 9, "token": {}}"#).unwrap();
        assert!(matches!(store.load().await, Err(CheckpointError::Corrupted(_))));
    }

    #[tokio::test]
    async fn test_bare_token_file_is_accepted() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), r#"{"_data": "8264A1B2C3"}"#).unwrap();

        let token = store.load().await.unwrap().unwrap();
        assert_eq!(token.as_document(), &doc! { "_data": "8264A1B2C3" });
    }

    #[tokio::test]
    async fn test_non_document_token_is_corrupted() {
        assert!(matches!(
            FileCheckpointStore::decode(br#"{"version": 1, "token": "abc"}"#),
            Err(CheckpointError::Corrupted(_))
        ));
        assert!(FileCheckpointStore::decode(b"[1, 2]").is_err());
    }

    #[tokio::test]
    async fn test_clear_removes_file() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.persist(&CheckpointToken::resume_token(doc! { "_data": "01" })).await.unwrap();

        store.clear().await.unwrap();
        assert!(!store.path().exists());
        assert!(store.load().await.unwrap().is_none());

        // Clearing twice is fine.
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_leftover_tmp_file_does_not_affect_load() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.persist(&CheckpointToken::log_position("binlog.000001", 4)).await.unwrap();
        std::fs::write(&store.tmp_path, "{\"version\": 1, \"tok").unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.as_log_position(), Some(("binlog.000001", 4)));
    }
}
