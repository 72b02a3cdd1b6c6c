//! Certificate hash to enrollment associations.

use rusqlite::{params, OptionalExtension};
use thiserror::Error;

use crate::DbPool;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection unavailable: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Looks up which enrollment a certificate hash belongs to.
pub trait CertAuthRetriever: Send + Sync {
    /// Returns the enrollment ID associated with `hash`, or an empty string
    /// when the hash is not associated with any enrollment.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` when the backing store cannot be queried.
    fn enrollment_from_hash(&self, hash: &str) -> Result<String, StoreError>;
}

/// Records which enrollment a certificate hash belongs to.
pub trait CertAuthStore: CertAuthRetriever {
    /// Records that `enrollment_id` authenticates with the certificate whose
    /// hash is `hash`. Re-associating an existing pair only bumps its
    /// `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` when the association cannot be written.
    fn associate_cert_hash(&self, enrollment_id: &str, hash: &str) -> Result<(), StoreError>;
}

/// SQLite-backed association store.
#[derive(Clone)]
pub struct SqliteCertAuthStore {
    pool: DbPool,
}

impl SqliteCertAuthStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl CertAuthStore for SqliteCertAuthStore {
    fn associate_cert_hash(&self, enrollment_id: &str, hash: &str) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO cert_auth_associations (id, sha256) VALUES (?1, ?2)
             ON CONFLICT (id, sha256) DO UPDATE SET updated_at = datetime('now')",
            params![enrollment_id, hash],
        )?;
        tracing::debug!(enrollment_id, hash, "associated certificate hash");
        Ok(())
    }
}

impl CertAuthRetriever for SqliteCertAuthStore {
    fn enrollment_from_hash(&self, hash: &str) -> Result<String, StoreError> {
        let conn = self.pool.get()?;
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM cert_auth_associations WHERE sha256 = ?1
                 ORDER BY updated_at DESC LIMIT 1",
                [hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations, DbRuntimeSettings};

    fn store() -> SqliteCertAuthStore {
        let settings = DbRuntimeSettings {
            pool_max_size: 1,
            ..DbRuntimeSettings::default()
        };
        let pool = create_pool(":memory:", settings).expect("pool");
        run_migrations(&pool.get().expect("conn")).expect("migrations");
        SqliteCertAuthStore::new(pool)
    }

    #[test]
    fn unknown_hash_yields_empty_id() {
        let store = store();
        assert_eq!(store.enrollment_from_hash("deadbeef").unwrap(), "");
    }

    #[test]
    fn associated_hash_resolves_to_enrollment() {
        let store = store();
        store.associate_cert_hash("device-1", "abc123").unwrap();
        assert_eq!(store.enrollment_from_hash("abc123").unwrap(), "device-1");
        assert_eq!(store.enrollment_from_hash("abc124").unwrap(), "");
    }

    #[test]
    fn reassociation_is_idempotent() {
        let store = store();
        store.associate_cert_hash("device-1", "abc123").unwrap();
        store.associate_cert_hash("device-1", "abc123").unwrap();

        let conn = store.pool.get().unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM cert_auth_associations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn missing_schema_is_a_store_error() {
        let settings = DbRuntimeSettings {
            pool_max_size: 1,
            ..DbRuntimeSettings::default()
        };
        let store = SqliteCertAuthStore::new(create_pool(":memory:", settings).unwrap());
        assert!(matches!(
            store.enrollment_from_hash("abc123"),
            Err(StoreError::Query(_))
        ));
    }
}
