#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **anima-store** – Durable memory stores for the Anima runtime.
//!
//! Two SQLite-backed stores share this crate: the episodic log
//! ([`EpisodicStore`]) and the embedding store ([`VectorStore`]), both
//! accessed through a single pooled connection with write-ahead journaling.
//! Validation failures return sentinels rather than errors, and storage
//! errors never propagate past the store that touched the disk — they are
//! logged and swallowed into the sentinel.
//!
//! The crate also owns the atomic-write discipline ([`atomic`]) used by
//! every JSON persister in the workspace: write to a sibling temp file,
//! then rename over the target. A crash leaves either the previous file or
//! the new one, never a partial.

pub mod atomic;
pub mod episodic;
pub mod vector;

pub use episodic::{EpisodicStore, ErrorRecord, Principle};
pub use vector::VectorStore;
