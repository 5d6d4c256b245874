// Database module
// Relational persistence for source, target, junction and synonym tables (SQLite)

pub mod sqlite;

pub use sqlite::*;
