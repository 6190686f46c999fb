// ABOUTME: Integration tests syncing a SQLite file with live PostgreSQL and MySQL servers
// ABOUTME: Ignored by default; set TEST_PG_URL or TEST_MYSQL_URL and run with --ignored

use std::path::Path;

use database_bisync::journal::JournalHandle;
use database_bisync::{SyncConfig, SyncEngine};
use mysql_async::prelude::Queryable;
use tempfile::TempDir;

const TABLE: &str = "bisync_it_customers";

fn config(local_db: &Path, dialect: &str, url: &str) -> SyncConfig {
    let text = format!(
        r#"
[engine]
gap_grace_ms = 0

[retry]
max_attempts = 1

[[endpoints]]
id = "laptop"
dialect = "sqlite"
dsn = '{local}'

[[endpoints]]
id = "server"
dialect = "{dialect}"
dsn = '{url}'

[[pairs]]
id = "customers"
local_endpoint = "laptop"
remote_endpoint = "server"
local_table = "{TABLE}"
remote_table = "{TABLE}"
primary_key = ["id"]
"#,
        local = local_db.display(),
    );
    let config = SyncConfig::from_toml(&text).unwrap();
    config.validate().unwrap();
    config
}

fn local_db() -> (TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("laptop.db");
    rusqlite::Connection::open(&path)
        .unwrap()
        .execute_batch(&format!(
            "CREATE TABLE {TABLE} (id INTEGER PRIMARY KEY, name TEXT NOT NULL, balance REAL)"
        ))
        .unwrap();
    (dir, path)
}

fn local_rows(path: &Path) -> Vec<(i64, String)> {
    let conn = rusqlite::Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare(&format!("SELECT id, name FROM {TABLE} ORDER BY id"))
        .unwrap();
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    rows
}

fn local_exec(path: &Path, sql: &str) {
    rusqlite::Connection::open(path)
        .unwrap()
        .execute_batch(sql)
        .unwrap();
}

async fn engine(config: SyncConfig) -> SyncEngine {
    let engine = SyncEngine::with_journal(config, JournalHandle::in_memory().unwrap());
    engine.setup_infrastructure().await.unwrap();
    engine
}

#[tokio::test]
#[ignore]
async fn test_postgres_round_trip() {
    let url = std::env::var("TEST_PG_URL").expect("TEST_PG_URL not set");
    let (client, connection) = tokio_postgres::connect(&url, tokio_postgres::NoTls)
        .await
        .unwrap();
    tokio::spawn(connection);

    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS {TABLE} CASCADE;
             DROP TABLE IF EXISTS {TABLE}_changelog;
             CREATE TABLE {TABLE} (id BIGINT PRIMARY KEY, name TEXT NOT NULL, balance NUMERIC(12, 2))"
        ))
        .await
        .unwrap();
    // Leftovers from an interrupted earlier run.
    let _ = client
        .execute(
            "DELETE FROM _bisync_cursor WHERE table_name = $1",
            &[&TABLE],
        )
        .await;

    let (_dir, local) = local_db();
    let engine = engine(config(&local, "postgres", &url)).await;

    client
        .batch_execute(&format!(
            "INSERT INTO {TABLE} (id, name, balance) VALUES (1, 'Ada', 10.50), (2, 'Grace', NULL)"
        ))
        .await
        .unwrap();
    let report = engine.run_pair_now("customers").await.unwrap();
    assert_eq!(report.applied_to_local, 2);
    assert_eq!(
        local_rows(&local),
        vec![(1, "Ada".to_string()), (2, "Grace".to_string())]
    );

    local_exec(
        &local,
        &format!("UPDATE {TABLE} SET name = 'Ada L.' WHERE id = 1; DELETE FROM {TABLE} WHERE id = 2"),
    );
    engine.run_pair_now("customers").await.unwrap();
    let rows = client
        .query(&format!("SELECT id, name FROM {TABLE} ORDER BY id"), &[])
        .await
        .unwrap();
    let remote: Vec<(i64, String)> = rows.iter().map(|r| (r.get(0), r.get(1))).collect();
    assert_eq!(remote, vec![(1, "Ada L.".to_string())]);

    let quiet = engine.run_pair_now("customers").await.unwrap();
    assert_eq!(quiet.rows_applied(), 0);

    engine.teardown_infrastructure().await.unwrap();
    client
        .batch_execute(&format!("DROP TABLE IF EXISTS {TABLE}"))
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn test_mysql_round_trip() {
    let url = std::env::var("TEST_MYSQL_URL").expect("TEST_MYSQL_URL not set");
    let pool = mysql_async::Pool::new(url.as_str());
    let mut conn = pool.get_conn().await.unwrap();

    conn.query_drop(format!("DROP TABLE IF EXISTS {TABLE}"))
        .await
        .unwrap();
    conn.query_drop(format!("DROP TABLE IF EXISTS {TABLE}_changelog"))
        .await
        .unwrap();
    conn.query_drop(format!(
        "CREATE TABLE {TABLE} (id BIGINT PRIMARY KEY, name VARCHAR(100) NOT NULL, balance DECIMAL(12, 2))"
    ))
    .await
    .unwrap();
    let _ = conn
        .exec_drop(
            "DELETE FROM _bisync_cursor WHERE table_name = ?",
            (TABLE,),
        )
        .await;

    let (_dir, local) = local_db();
    let engine = engine(config(&local, "mysql", &url)).await;

    local_exec(
        &local,
        &format!("INSERT INTO {TABLE} (id, name, balance) VALUES (7, 'Linus', 3.25)"),
    );
    let report = engine.run_pair_now("customers").await.unwrap();
    assert_eq!(report.applied_to_remote, 1);
    let remote: Vec<(i64, String)> = conn
        .query(format!("SELECT id, name FROM {TABLE} ORDER BY id"))
        .await
        .unwrap();
    assert_eq!(remote, vec![(7, "Linus".to_string())]);

    conn.query_drop(format!("UPDATE {TABLE} SET name = 'Linus T.' WHERE id = 7"))
        .await
        .unwrap();
    engine.run_pair_now("customers").await.unwrap();
    assert_eq!(local_rows(&local), vec![(7, "Linus T.".to_string())]);

    let quiet = engine.run_pair_now("customers").await.unwrap();
    assert_eq!(quiet.rows_applied(), 0);

    engine.teardown_infrastructure().await.unwrap();
    conn.query_drop(format!("DROP TABLE IF EXISTS {TABLE}"))
        .await
        .unwrap();
    drop(conn);
    pool.disconnect().await.unwrap();
}
