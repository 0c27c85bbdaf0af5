//! Assistant session-id continuity.
//!
//! The session identifier is opaque; persisting it lets a relaunched agent in
//! the same working directory resume the prior conversation. The file name is
//! keyed by a short hash of the working directory so distinct workspaces do
//! not clobber each other's state.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// In-memory session state, shared between the executor and handlers.
#[derive(Debug, Default)]
pub struct SessionState {
    pub session_id: Option<String>,
    /// True once this process has completed at least one query; drives the
    /// "continue most recent" resumption mode when no explicit id is stored.
    pub started: bool,
}

/// On-disk layout of the session file.
#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    work_dir: String,
    session_id: Option<String>,
    updated_at: String,
}

/// Owner of the session file for one working directory.
pub struct SessionStore {
    path: PathBuf,
    work_dir: String,
    state: Mutex<SessionState>,
}

fn short_hash(work_dir: &str) -> String {
    let digest = md5::compute(work_dir.as_bytes());
    format!("{digest:x}")[..12].to_string()
}

impl SessionStore {
    pub fn new(session_dir: &Path, work_dir: &str) -> Self {
        let path = session_dir.join(format!("session_{}.json", short_hash(work_dir)));
        Self {
            path,
            work_dir: work_dir.to_string(),
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Load the persisted id into memory. Skipped entirely when the user
    /// asked for a fresh conversation.
    pub fn load(&self) {
        if !self.path.exists() {
            return;
        }
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<SessionFile>(&content) {
                Ok(file) => {
                    if let Some(id) = file.session_id {
                        debug!(session_id = %id, "loaded persisted session");
                        self.state.lock().unwrap().session_id = Some(id);
                    }
                }
                Err(e) => warn!(error = %e, "session file is corrupt, starting fresh"),
            },
            Err(e) => warn!(error = %e, "cannot read session file"),
        }
    }

    /// Persist a newly reported id and adopt it in memory.
    pub fn save(&self, session_id: &str) {
        self.state.lock().unwrap().session_id = Some(session_id.to_string());
        let file = SessionFile {
            work_dir: self.work_dir.clone(),
            session_id: Some(session_id.to_string()),
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        self.write(&file);
    }

    /// Forget the stored id (stale-session recovery and explicit reset).
    pub fn clear(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.session_id = None;
            state.started = false;
        }
        let file = SessionFile {
            work_dir: self.work_dir.clone(),
            session_id: None,
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        self.write(&file);
    }

    fn write(&self, file: &SessionFile) {
        let content = match serde_json::to_string_pretty(file) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "cannot serialize session file");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, content) {
            warn!(error = %e, path = %self.path.display(), "cannot write session file");
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().unwrap().session_id.clone()
    }

    pub fn started(&self) -> bool {
        self.state.lock().unwrap().started
    }

    pub fn mark_started(&self) {
        self.state.lock().unwrap().started = true;
    }

    /// Adopt a server-provided id without clobbering an existing one.
    pub fn adopt_if_absent(&self, session_id: &str) -> bool {
        if self.state.lock().unwrap().session_id.is_some() {
            return false;
        }
        self.save(session_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vibecheck_session_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = scratch("roundtrip");
        {
            let store = SessionStore::new(&dir, "/work");
            store.save("sess-123");
        }
        let store = SessionStore::new(&dir, "/work");
        store.load();
        assert_eq!(store.session_id().as_deref(), Some("sess-123"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn distinct_work_dirs_use_distinct_files() {
        let dir = scratch("distinct");
        let a = SessionStore::new(&dir, "/work/a");
        let b = SessionStore::new(&dir, "/work/b");
        a.save("aaa");
        b.save("bbb");
        let a2 = SessionStore::new(&dir, "/work/a");
        a2.load();
        assert_eq!(a2.session_id().as_deref(), Some("aaa"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn clear_resets_id_and_started() {
        let dir = scratch("clear");
        let store = SessionStore::new(&dir, "/work");
        store.save("sess");
        store.mark_started();
        store.clear();
        assert_eq!(store.session_id(), None);
        assert!(!store.started());
        let store2 = SessionStore::new(&dir, "/work");
        store2.load();
        assert_eq!(store2.session_id(), None);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn adopt_does_not_overwrite() {
        let dir = scratch("adopt");
        let store = SessionStore::new(&dir, "/work");
        assert!(store.adopt_if_absent("first"));
        assert!(!store.adopt_if_absent("second"));
        assert_eq!(store.session_id().as_deref(), Some("first"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn hash_prefix_is_twelve_chars() {
        assert_eq!(short_hash("/some/dir").len(), 12);
    }
}
