//! PostgreSQL adapters.

pub mod postgres;

pub use postgres::PgWorkflowStore;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
