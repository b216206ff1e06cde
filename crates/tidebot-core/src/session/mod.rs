//! Session store: in-memory cache, JSONL persistence and keyed turn locks.
//!
//! # Disk format (JSONL)
//!
//! Each session is a `.jsonl` file under `~/.tidebot/sessions/`.
//! - Line 1: metadata `{"_type": "metadata", "key": "...", "turns": 3, ...}`
//! - Lines 2+: messages `{"role": "user", "content": "hello"}`

pub mod manager;

pub use manager::{SessionError, SessionLock, SessionManager, SessionSummary};
