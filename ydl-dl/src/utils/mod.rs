//! Utility modules for ydl-dl

pub mod db_retry;

pub use db_retry::{retry_on_lock, LEDGER_LOCK_WAIT};
