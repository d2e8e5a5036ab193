// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod records;
mod store;

pub use records::{BackupRecord, SessionRecord};
pub use store::SessionStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {id} not found")]
    SessionNotFound { id: String },
    #[error("session {id} is corrupt and no backup exists")]
    SessionCorrupt { id: String },
    #[error("backup {id} not found")]
    BackupMissing { id: String },
    #[error("backup {backup_id} does not belong to session {session_id}")]
    BackupMismatch {
        backup_id: String,
        session_id: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}
