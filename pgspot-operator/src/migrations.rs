use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

/// Schema steps, applied in order. Roll-forward only: never edit or reorder
/// an entry, append a new one. Step N is recorded in `schema_migrations` with id N.
pub const MIGRATIONS: &[&str] = &[
    // 1
    r#"CREATE TABLE IF NOT EXISTS instance (
        id BLOB PRIMARY KEY,
        cloud TEXT NOT NULL,
        region TEXT NOT NULL,
        instance_name TEXT NOT NULL,
        postgres_version INTEGER NOT NULL,
        storage_type TEXT NOT NULL,
        storage_min INTEGER,
        cpu_min INTEGER,
        ram_min INTEGER,
        user_tags TEXT NOT NULL DEFAULT '{}',
        created_on TEXT NOT NULL,
        last_modified_on TEXT NOT NULL,
        deleted_on TEXT
    )"#,
    // 2
    r#"CREATE UNIQUE INDEX IF NOT EXISTS instance_cloud_name_active
        ON instance (cloud, instance_name) WHERE deleted_on IS NULL"#,
    // 3
    r#"CREATE TABLE IF NOT EXISTS vm (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        instance_id BLOB NOT NULL REFERENCES instance (id),
        provider_id TEXT NOT NULL UNIQUE,
        cloud TEXT NOT NULL,
        region TEXT NOT NULL,
        availability_zone TEXT NOT NULL,
        sku TEXT NOT NULL,
        price_spot REAL,
        price_ondemand REAL,
        cpu INTEGER,
        ram_mb INTEGER,
        instance_storage_gb INTEGER,
        login_user TEXT NOT NULL,
        ip_private TEXT NOT NULL,
        ip_public TEXT,
        created_on TEXT NOT NULL,
        last_modified_on TEXT NOT NULL,
        deleted_on TEXT
    )"#,
    // 4
    r#"CREATE INDEX IF NOT EXISTS vm_instance_id ON vm (instance_id)"#,
    // 5
    r#"CREATE TABLE IF NOT EXISTS manifest_snapshot (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        instance_id BLOB NOT NULL REFERENCES instance (id),
        created_on TEXT NOT NULL,
        manifest TEXT NOT NULL
    )"#,
    // 6
    r#"ALTER TABLE manifest_snapshot ADD COLUMN setup_finished_on TEXT"#,
    // 7
    r#"CREATE TABLE IF NOT EXISTS ignored_instance (
        instance_name TEXT PRIMARY KEY,
        created_on TEXT NOT NULL
    )"#,
    // 8
    r#"ALTER TABLE vm ADD COLUMN volume_id TEXT"#,
];

pub async fn applied_version(pool: &SqlitePool) -> Result<i64> {
    let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    Ok(max.unwrap_or(0))
}

/// Apply pending steps. Each step and its log row commit together, so an
/// interrupted run resumes at the first unrecorded step. Returns the number
/// of steps applied.
pub async fn run_migrations(pool: &SqlitePool) -> Result<usize> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (id INTEGER PRIMARY KEY, applied_on TEXT NOT NULL)",
    )
    .execute(pool)
    .await
    .context("failed to create schema_migrations")?;

    let current = applied_version(pool).await?;
    let mut applied = 0;

    for (idx, ddl) in MIGRATIONS.iter().enumerate() {
        let id = idx as i64 + 1;
        if id <= current {
            continue;
        }
        let mut tx = pool.begin().await?;
        sqlx::query(ddl)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("migration {} failed", id))?;
        sqlx::query("INSERT INTO schema_migrations (id, applied_on) VALUES (?, ?)")
            .bind(id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        applied += 1;
    }

    if applied > 0 {
        tracing::info!(
            "📦 [cmdb] applied {} migration(s), schema at version {}",
            applied,
            MIGRATIONS.len()
        );
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = memory_pool().await;
        assert_eq!(run_migrations(&pool).await.unwrap(), MIGRATIONS.len());
        assert_eq!(run_migrations(&pool).await.unwrap(), 0);
        assert_eq!(applied_version(&pool).await.unwrap(), MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn resumes_after_partial_run() {
        let pool = memory_pool().await;
        sqlx::query(
            "CREATE TABLE schema_migrations (id INTEGER PRIMARY KEY, applied_on TEXT NOT NULL)",
        )
        .execute(&pool)
        .await
        .unwrap();
        // Simulate a run that stopped after the first three steps.
        for (idx, ddl) in MIGRATIONS.iter().take(3).enumerate() {
            sqlx::query(ddl).execute(&pool).await.unwrap();
            sqlx::query("INSERT INTO schema_migrations (id, applied_on) VALUES (?, ?)")
                .bind(idx as i64 + 1)
                .bind(Utc::now())
                .execute(&pool)
                .await
                .unwrap();
        }

        assert_eq!(run_migrations(&pool).await.unwrap(), MIGRATIONS.len() - 3);
        let cols: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info('vm')")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert!(cols.iter().any(|c| c == "volume_id"));
    }
}
