//! Database adapter for the alert manager (spec §4.5): reads ready alerts
//! and media type configuration, and flushes buffered status updates.

pub mod repository;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use repository::AlertStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteAlertStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresAlertStore;
