use tessera_db::{
    create_pool, run_migrations, CertAuthRetriever, CertAuthStore, DbRuntimeSettings,
    SqliteCertAuthStore,
};

#[test]
fn associations_survive_reopening_the_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tessera.db");
    let path = path.to_str().expect("utf-8 path");

    {
        let pool = create_pool(path, DbRuntimeSettings::default()).expect("pool");
        let applied = run_migrations(&pool.get().expect("conn")).expect("migrations");
        assert_eq!(applied, 1);
        SqliteCertAuthStore::new(pool)
            .associate_cert_hash("device-1", "abc123")
            .expect("associate");
    }

    let pool = create_pool(path, DbRuntimeSettings::default()).expect("pool");
    let applied = run_migrations(&pool.get().expect("conn")).expect("migrations");
    assert_eq!(applied, 0);

    let store = SqliteCertAuthStore::new(pool);
    assert_eq!(store.enrollment_from_hash("abc123").unwrap(), "device-1");
}
