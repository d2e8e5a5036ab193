// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! File-backed session and backup persistence.
//!
//! Layout: one JSON document per session under `<root>/sessions/<id>.json`,
//! one per backup under `<root>/backups/<backup_id>.json`.  Writes go
//! through a temp file in the target directory, are fsynced, then renamed
//! into place; a crash mid-write never leaves a corrupt file behind.
//! A session that fails to parse falls back to its newest backup.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{BackupRecord, SessionRecord, StoreError};

pub struct SessionStore {
    sessions_dir: PathBuf,
    backups_dir: PathBuf,
}

impl SessionStore {
    /// Open (creating directories as needed) the store rooted at `root`,
    /// or the default user data directory when `None`.
    pub fn open(root: Option<PathBuf>) -> Result<Self, StoreError> {
        let root = match root {
            Some(r) => r,
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("nils"),
        };
        let sessions_dir = root.join("sessions");
        let backups_dir = root.join("backups");
        fs::create_dir_all(&sessions_dir)?;
        fs::create_dir_all(&backups_dir)?;
        Ok(Self {
            sessions_dir,
            backups_dir,
        })
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{id}.json"))
    }

    fn backup_path(&self, backup_id: &str) -> PathBuf {
        self.backups_dir.join(format!("{backup_id}.json"))
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    pub fn save_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(session)?;
        write_atomic(&self.session_path(&session.id), &bytes)?;
        debug!(session_id = %session.id, messages = session.messages.len(), "session saved");
        Ok(())
    }

    /// Load a session by id.  On parse failure the newest backup for that
    /// session is restored transparently; only when no backup exists does
    /// the corruption surface to the caller.
    pub fn load_session(&self, id: &str) -> Result<SessionRecord, StoreError> {
        let path = self.session_path(id);
        if !path.exists() {
            return Err(StoreError::SessionNotFound { id: id.into() });
        }
        let text = fs::read_to_string(&path)?;
        match serde_json::from_str::<SessionRecord>(&text) {
            Ok(session) => Ok(session),
            Err(e) => {
                warn!(session_id = %id, error = %e, "session file corrupt; trying backups");
                match self.newest_backup_for(id)? {
                    Some(backup) => {
                        let mut session = SessionRecord::new(PathBuf::from("."), serde_json::Value::Null);
                        session.id = id.to_string();
                        session.created_at = backup.created_at;
                        session.updated_at = backup.created_at;
                        session.messages = backup.messages;
                        Ok(session)
                    }
                    None => Err(StoreError::SessionCorrupt { id: id.into() }),
                }
            }
        }
    }

    /// Ids of all stored sessions, newest first by file modification time.
    pub fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        let mut entries: Vec<(std::time::SystemTime, String)> = Vec::new();
        for entry in fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                entries.push((modified, stem.to_string()));
            }
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries.into_iter().map(|(_, id)| id).collect())
    }

    // ── Backups ──────────────────────────────────────────────────────────────

    /// Snapshot the session's current message log.  Called immediately
    /// before compression mutates it.
    pub fn create_backup(
        &self,
        session: &SessionRecord,
        reason: &str,
    ) -> Result<BackupRecord, StoreError> {
        let backup = BackupRecord::of(session, reason);
        let bytes = serde_json::to_vec_pretty(&backup)?;
        write_atomic(&self.backup_path(&backup.id), &bytes)?;
        debug!(
            session_id = %session.id,
            backup_id = %backup.id,
            messages = backup.messages.len(),
            "backup created"
        );
        Ok(backup)
    }

    pub fn load_backup(&self, backup_id: &str) -> Result<BackupRecord, StoreError> {
        let path = self.backup_path(backup_id);
        if !path.exists() {
            return Err(StoreError::BackupMissing {
                id: backup_id.into(),
            });
        }
        let text = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Replace the session's message log with the backup's, preserving the
    /// session id, and persist the result.
    pub fn restore_backup(
        &self,
        session: &mut SessionRecord,
        backup_id: &str,
    ) -> Result<(), StoreError> {
        let backup = self.load_backup(backup_id)?;
        if backup.session_id != session.id {
            return Err(StoreError::BackupMismatch {
                backup_id: backup_id.into(),
                session_id: session.id.clone(),
            });
        }
        session.messages = backup.messages;
        session.updated_at = chrono::Utc::now();
        self.save_session(session)
    }

    /// Backups belonging to a session, newest first.
    pub fn list_backups(&self, session_id: &str) -> Result<Vec<BackupRecord>, StoreError> {
        let mut backups: Vec<BackupRecord> = Vec::new();
        for entry in fs::read_dir(&self.backups_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path)?;
            match serde_json::from_str::<BackupRecord>(&text) {
                Ok(b) if b.session_id == session_id => backups.push(b),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable backup"),
            }
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    fn newest_backup_for(&self, session_id: &str) -> Result<Option<BackupRecord>, StoreError> {
        Ok(self.list_backups(session_id)?.into_iter().next())
    }
}

/// Serialize-to-temp, fsync, rename.  The rename is atomic on POSIX, so
/// readers observe either the old or the new file, never a torn write.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().ok_or_else(|| {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "target path has no parent directory",
        ))
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nils_model::Message;
    use tempfile::TempDir;

    fn store() -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(Some(dir.path().to_path_buf())).unwrap();
        (dir, store)
    }

    fn session_with_messages() -> SessionRecord {
        let mut s = SessionRecord::new("/work".into(), serde_json::json!({}));
        s.messages.push(Message::system("prompt"));
        s.messages.push(Message::user("list the files"));
        s.messages.push(Message::assistant("done"));
        s
    }

    // ── Save / load round-trip ────────────────────────────────────────────────

    #[test]
    fn save_then_load_round_trips() {
        let (_dir, store) = store();
        let s = session_with_messages();
        store.save_session(&s).unwrap();
        let loaded = store.load_session(&s.id).unwrap();
        assert_eq!(loaded.id, s.id);
        assert_eq!(loaded.messages.len(), 3);
        assert_eq!(loaded.messages[1].content, "list the files");
        assert_eq!(loaded.messages[1].timestamp, s.messages[1].timestamp);
    }

    #[test]
    fn load_missing_session_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.load_session("nope"),
            Err(StoreError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn save_overwrites_previous_version() {
        let (_dir, store) = store();
        let mut s = session_with_messages();
        store.save_session(&s).unwrap();
        s.messages.push(Message::user("more"));
        store.save_session(&s).unwrap();
        let loaded = store.load_session(&s.id).unwrap();
        assert_eq!(loaded.messages.len(), 4);
    }

    #[test]
    fn list_sessions_contains_saved_ids() {
        let (_dir, store) = store();
        let a = session_with_messages();
        let b = session_with_messages();
        store.save_session(&a).unwrap();
        store.save_session(&b).unwrap();
        let ids = store.list_sessions().unwrap();
        assert!(ids.contains(&a.id));
        assert!(ids.contains(&b.id));
    }

    // ── Corruption fallback ───────────────────────────────────────────────────

    #[test]
    fn corrupt_session_without_backup_reports_corrupt() {
        let (_dir, store) = store();
        let s = session_with_messages();
        store.save_session(&s).unwrap();
        fs::write(store.session_path(&s.id), b"{ not json").unwrap();
        assert!(matches!(
            store.load_session(&s.id),
            Err(StoreError::SessionCorrupt { .. })
        ));
    }

    #[test]
    fn corrupt_session_falls_back_to_backup() {
        let (_dir, store) = store();
        let s = session_with_messages();
        store.save_session(&s).unwrap();
        store.create_backup(&s, "compression").unwrap();
        fs::write(store.session_path(&s.id), b"garbage").unwrap();
        let recovered = store.load_session(&s.id).unwrap();
        assert_eq!(recovered.id, s.id);
        assert_eq!(recovered.messages.len(), 3);
    }

    // ── Backups ──────────────────────────────────────────────────────────────

    #[test]
    fn backup_restore_returns_log_to_snapshot_state() {
        let (_dir, store) = store();
        let mut s = session_with_messages();
        store.save_session(&s).unwrap();
        let backup = store.create_backup(&s, "compression").unwrap();

        // Simulate compression replacing the log.
        s.messages = vec![Message::system("prompt"), Message::system("summary")];
        store.save_session(&s).unwrap();

        store.restore_backup(&mut s, &backup.id).unwrap();
        assert_eq!(s.messages.len(), 3);
        assert_eq!(s.messages[2].content, "done");
        // And the restoration is itself persisted.
        let reloaded = store.load_session(&s.id).unwrap();
        assert_eq!(reloaded.messages.len(), 3);
    }

    #[test]
    fn restore_rejects_backup_of_other_session() {
        let (_dir, store) = store();
        let other = session_with_messages();
        let backup = store.create_backup(&other, "compression").unwrap();
        let mut mine = session_with_messages();
        assert!(matches!(
            store.restore_backup(&mut mine, &backup.id),
            Err(StoreError::BackupMismatch { .. })
        ));
    }

    #[test]
    fn missing_backup_reported() {
        let (_dir, store) = store();
        assert!(matches!(
            store.load_backup("ghost"),
            Err(StoreError::BackupMissing { .. })
        ));
    }

    #[test]
    fn list_backups_filters_by_session_and_sorts_newest_first() {
        let (_dir, store) = store();
        let s = session_with_messages();
        let other = session_with_messages();
        let b1 = store.create_backup(&s, "compression").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b2 = store.create_backup(&s, "compression").unwrap();
        store.create_backup(&other, "compression").unwrap();

        let backups = store.list_backups(&s.id).unwrap();
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0].id, b2.id, "newest first");
        assert_eq!(backups[1].id, b1.id);
    }

    // ── Atomic write ─────────────────────────────────────────────────────────

    #[test]
    fn write_atomic_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
    }

    #[test]
    fn write_atomic_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.json");
        write_atomic(&path, b"data").unwrap();
        let count = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(count, 1, "only the target file should remain");
    }
}
