//! Storage for the Tessera MDM server.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! embedded SQL migrations, and the certificate-to-enrollment association
//! store consulted when binding a request to an enrollment.
//!
//! Every table is created through versioned migrations managed by this crate.

mod cert_auth;
mod migrations;
mod pool;

pub use cert_auth::{CertAuthRetriever, CertAuthStore, SqliteCertAuthStore, StoreError};
pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
