//! presence-store: SQLite persistence for identities and attendance.

pub mod sqlite;

pub use sqlite::SqliteStore;
