//! # Settlematch Postgres
//!
//! PostgreSQL backends for the Settlematch matching engine:
//!
//! - [`PostgresMatchStore`]: transactional keyed match store
//! - [`PostgresAnomalySink`]: append-only anomaly log plus replay quarantine
//!
//! Both speak through a shared [`sqlx::PgPool`]; schema lives in the
//! `migrations/` directory at the crate root.
//!
//! ## Setup
//!
//! ```no_run
//! use settlematch_postgres::{PostgresAnomalySink, PostgresMatchStore};
//! use sqlx::postgres::PgPoolOptions;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = PgPoolOptions::new()
//!     .max_connections(10)
//!     .connect("postgres://localhost/settlematch")
//!     .await?;
//!
//! let store = PostgresMatchStore::new(pool.clone());
//! let sink = PostgresAnomalySink::new(pool);
//! # Ok(())
//! # }
//! ```

/// PostgreSQL anomaly sink and quarantine.
pub mod anomaly;

/// PostgreSQL match store.
pub mod store;

// Re-export commonly used items
pub use anomaly::PostgresAnomalySink;
pub use store::PostgresMatchStore;
