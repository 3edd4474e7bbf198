//! Durable session records: status, resumable block state and run log.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::RuntimeError;

use super::machine::AutomationState;
use super::StoreFuture;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLogEntry {
    pub at_ms: i64,
    pub block: SmolStr,
    pub block_type: SmolStr,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SmolStr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SmolStr,
    pub program_id: SmolStr,
    pub status: AutomationState,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub resume_state: IndexMap<SmolStr, Value>,
    #[serde(default)]
    pub logs: Vec<SessionLogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SmolStr>,
}

impl SessionRecord {
    fn new(id: SmolStr, program_id: &str, now_ms: i64) -> Self {
        Self {
            id,
            program_id: SmolStr::new(program_id),
            status: AutomationState::Loaded,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            resume_state: IndexMap::new(),
            logs: Vec::new(),
            error: None,
        }
    }
}

/// Persistence collaborator for run sessions.
pub trait SessionStore: Send + Sync {
    fn create(&self, program_id: &str, now_ms: i64) -> StoreFuture<'_, Result<SessionRecord, RuntimeError>>;

    fn load(&self, session: &str) -> StoreFuture<'_, Result<Option<SessionRecord>, RuntimeError>>;

    fn set_status(
        &self,
        session: &str,
        status: AutomationState,
        error: Option<SmolStr>,
        now_ms: i64,
    ) -> StoreFuture<'_, Result<(), RuntimeError>>;

    /// Write (`Some`) or clear (`None`) one block's resumable state.
    fn set_resume_state(
        &self,
        session: &str,
        block: &str,
        state: Option<Value>,
    ) -> StoreFuture<'_, Result<(), RuntimeError>>;

    fn clear_resume_state(&self, session: &str) -> StoreFuture<'_, Result<(), RuntimeError>>;

    fn append_log(
        &self,
        session: &str,
        entry: SessionLogEntry,
    ) -> StoreFuture<'_, Result<(), RuntimeError>>;
}

fn session_id(program_id: &str, now_ms: i64, seq: u64) -> SmolStr {
    SmolStr::new(format!("{program_id}-{now_ms}-{seq}"))
}

fn missing(session: &str) -> RuntimeError {
    RuntimeError::SessionStore(format!("session '{session}' not found").into())
}

/// Sessions kept in process memory.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<IndexMap<SmolStr, SessionRecord>>,
    next: AtomicU64,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update(
        &self,
        session: &str,
        apply: impl FnOnce(&mut SessionRecord),
    ) -> Result<(), RuntimeError> {
        let mut sessions = self.sessions.lock();
        let record = sessions.get_mut(session).ok_or_else(|| missing(session))?;
        apply(record);
        Ok(())
    }
}

impl SessionStore for MemorySessionStore {
    fn create(&self, program_id: &str, now_ms: i64) -> StoreFuture<'_, Result<SessionRecord, RuntimeError>> {
        let seq = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let record = SessionRecord::new(session_id(program_id, now_ms, seq), program_id, now_ms);
        self.sessions.lock().insert(record.id.clone(), record.clone());
        Box::pin(async move { Ok(record) })
    }

    fn load(&self, session: &str) -> StoreFuture<'_, Result<Option<SessionRecord>, RuntimeError>> {
        let record = self.sessions.lock().get(session).cloned();
        Box::pin(async move { Ok(record) })
    }

    fn set_status(
        &self,
        session: &str,
        status: AutomationState,
        error: Option<SmolStr>,
        now_ms: i64,
    ) -> StoreFuture<'_, Result<(), RuntimeError>> {
        let result = self.update(session, |record| {
            record.status = status;
            record.error = error;
            record.updated_at_ms = now_ms;
        });
        Box::pin(async move { result })
    }

    fn set_resume_state(
        &self,
        session: &str,
        block: &str,
        state: Option<Value>,
    ) -> StoreFuture<'_, Result<(), RuntimeError>> {
        let result = self.update(session, |record| apply_resume(record, block, state));
        Box::pin(async move { result })
    }

    fn clear_resume_state(&self, session: &str) -> StoreFuture<'_, Result<(), RuntimeError>> {
        let result = self.update(session, |record| record.resume_state.clear());
        Box::pin(async move { result })
    }

    fn append_log(
        &self,
        session: &str,
        entry: SessionLogEntry,
    ) -> StoreFuture<'_, Result<(), RuntimeError>> {
        let result = self.update(session, |record| record.logs.push(entry));
        Box::pin(async move { result })
    }
}

fn apply_resume(record: &mut SessionRecord, block: &str, state: Option<Value>) {
    match state {
        Some(state) => {
            record.resume_state.insert(SmolStr::new(block), state);
        }
        None => {
            record.resume_state.shift_remove(block);
        }
    }
}

/// One JSON file per session under a directory.
#[derive(Debug)]
pub struct FileSessionStore {
    root: PathBuf,
    next: AtomicU64,
    /// Serializes read-modify-write cycles.
    gate: AsyncMutex<()>,
}

impl FileSessionStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next: AtomicU64::new(0),
            gate: AsyncMutex::new(()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, session: &str) -> Result<PathBuf, RuntimeError> {
        if session.is_empty() || session.contains(['/', '\\']) || session.starts_with('.') {
            return Err(RuntimeError::SessionStore(
                format!("invalid session id '{session}'").into(),
            ));
        }
        Ok(self.root.join(format!("{session}.json")))
    }

    async fn read(&self, session: &str) -> Result<Option<SessionRecord>, RuntimeError> {
        let path = self.path_for(session)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(RuntimeError::SessionStore(
                    format!("read {}: {err}", path.display()).into(),
                ))
            }
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|err| {
            RuntimeError::SessionStore(format!("parse {}: {err}", path.display()).into())
        })
    }

    async fn write(&self, record: &SessionRecord) -> Result<(), RuntimeError> {
        let path = self.path_for(&record.id)?;
        tokio::fs::create_dir_all(&self.root).await.map_err(|err| {
            RuntimeError::SessionStore(format!("create {}: {err}", self.root.display()).into())
        })?;
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|err| RuntimeError::SessionStore(format!("encode: {err}").into()))?;
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, &bytes).await.map_err(|err| {
            RuntimeError::SessionStore(format!("write {}: {err}", staging.display()).into())
        })?;
        tokio::fs::rename(&staging, &path).await.map_err(|err| {
            RuntimeError::SessionStore(format!("rename {}: {err}", path.display()).into())
        })
    }

    async fn update(
        &self,
        session: &str,
        apply: impl FnOnce(&mut SessionRecord) + Send,
    ) -> Result<(), RuntimeError> {
        let _guard = self.gate.lock().await;
        let mut record = self.read(session).await?.ok_or_else(|| missing(session))?;
        apply(&mut record);
        self.write(&record).await
    }
}

impl SessionStore for FileSessionStore {
    fn create(&self, program_id: &str, now_ms: i64) -> StoreFuture<'_, Result<SessionRecord, RuntimeError>> {
        let seq = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        let record = SessionRecord::new(session_id(program_id, now_ms, seq), program_id, now_ms);
        Box::pin(async move {
            let _guard = self.gate.lock().await;
            self.write(&record).await?;
            Ok(record)
        })
    }

    fn load(&self, session: &str) -> StoreFuture<'_, Result<Option<SessionRecord>, RuntimeError>> {
        let session = SmolStr::new(session);
        Box::pin(async move { self.read(&session).await })
    }

    fn set_status(
        &self,
        session: &str,
        status: AutomationState,
        error: Option<SmolStr>,
        now_ms: i64,
    ) -> StoreFuture<'_, Result<(), RuntimeError>> {
        let session = SmolStr::new(session);
        Box::pin(async move {
            self.update(&session, move |record| {
                record.status = status;
                record.error = error;
                record.updated_at_ms = now_ms;
            })
            .await
        })
    }

    fn set_resume_state(
        &self,
        session: &str,
        block: &str,
        state: Option<Value>,
    ) -> StoreFuture<'_, Result<(), RuntimeError>> {
        let session = SmolStr::new(session);
        let block = SmolStr::new(block);
        Box::pin(async move {
            self.update(&session, move |record| apply_resume(record, &block, state))
                .await
        })
    }

    fn clear_resume_state(&self, session: &str) -> StoreFuture<'_, Result<(), RuntimeError>> {
        let session = SmolStr::new(session);
        Box::pin(async move {
            self.update(&session, |record| record.resume_state.clear())
                .await
        })
    }

    fn append_log(
        &self,
        session: &str,
        entry: SessionLogEntry,
    ) -> StoreFuture<'_, Result<(), RuntimeError>> {
        let session = SmolStr::new(session);
        Box::pin(async move {
            self.update(&session, move |record| record.logs.push(entry))
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
        std::env::temp_dir().join(format!("hydro-sessions-{name}-{nanos}"))
    }

    #[tokio::test]
    async fn memory_store_tracks_resume_state_per_block() {
        let store = MemorySessionStore::new();
        let session = store.create("dose", 10).await.expect("create");
        store
            .set_resume_state(&session.id, "wait", Some(json!({"remaining_ms": 600})))
            .await
            .expect("write");
        store
            .set_resume_state(&session.id, "loop", Some(json!({"iteration": 2})))
            .await
            .expect("write");
        store
            .set_resume_state(&session.id, "wait", None)
            .await
            .expect("clear");
        let record = store.load(&session.id).await.expect("load").expect("record");
        assert_eq!(record.resume_state.len(), 1);
        assert!(record.resume_state.contains_key("loop"));
        assert!(store.set_status("nope", AutomationState::Running, None, 0).await.is_err());
    }

    #[tokio::test]
    async fn file_store_round_trips_through_disk() {
        let root = temp_dir("roundtrip");
        let store = FileSessionStore::new(&root);
        let session = store.create("dose", 10).await.expect("create");
        store
            .set_status(&session.id, AutomationState::Paused, None, 20)
            .await
            .expect("status");
        store
            .set_resume_state(&session.id, "wait", Some(json!({"remaining_ms": 600})))
            .await
            .expect("resume");
        store
            .append_log(
                &session.id,
                SessionLogEntry {
                    at_ms: 21,
                    block: "start".into(),
                    block_type: "START".into(),
                    success: true,
                    output: None,
                    error: None,
                },
            )
            .await
            .expect("log");

        let reopened = FileSessionStore::new(&root);
        let record = reopened
            .load(&session.id)
            .await
            .expect("load")
            .expect("record");
        assert_eq!(record.status, AutomationState::Paused);
        assert_eq!(record.updated_at_ms, 20);
        assert_eq!(record.resume_state["wait"], json!({"remaining_ms": 600}));
        assert_eq!(record.logs.len(), 1);
        assert_eq!(reopened.load("missing").await.expect("load"), None);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn file_store_rejects_path_like_ids() {
        let store = FileSessionStore::new(temp_dir("ids"));
        assert!(store.load("../etc/passwd").await.is_err());
    }
}
