//! Foundational low-level utilities shared across relay crates.
//!
//! Provides atomic file-write helpers for persisted instance state and the
//! millisecond clock helpers used by idle tracking and event envelopes.

pub mod atomic_io;
pub mod time_utils;

pub use atomic_io::{write_json_atomic, write_text_atomic};
pub use time_utils::{current_unix_timestamp_ms, idle_for_ms, is_idle_beyond};
