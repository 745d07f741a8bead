//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "workspaces_and_conversations",
        sql: r#"
            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                system_prompt TEXT NOT NULL DEFAULT '',
                ai_enabled_default INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS channel_credentials (
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                channel TEXT NOT NULL,
                credentials TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (workspace_id, channel)
            );

            CREATE TABLE IF NOT EXISTS clients (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                channel TEXT NOT NULL,
                external_id TEXT,
                phone_number TEXT NOT NULL,
                display_name TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (workspace_id, phone_number, channel)
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
                channel TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                ai_enabled INTEGER NOT NULL DEFAULT 1,
                last_activity_at TEXT NOT NULL,
                external_thread_id TEXT,
                context TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                UNIQUE (workspace_id, client_id, channel)
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_client ON conversations(client_id);

            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                status TEXT NOT NULL,
                provider_message_id TEXT,
                error TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
                ON messages(conversation_id, timestamp, seq);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_inbound_dedupe
                ON messages(conversation_id, provider_message_id)
                WHERE sender = 'client' AND provider_message_id IS NOT NULL;
        "#,
    },
    Migration {
        version: 2,
        name: "sequences",
        sql: r#"
            CREATE TABLE IF NOT EXISTS sequence_rules (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                family TEXT NOT NULL,
                delay_seconds INTEGER NOT NULL,
                instruction TEXT NOT NULL,
                position INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sequence_rules_workspace
                ON sequence_rules(workspace_id, family);

            CREATE TABLE IF NOT EXISTS sequence_runs (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
                conversation_id TEXT REFERENCES conversations(id) ON DELETE SET NULL,
                family TEXT NOT NULL,
                status TEXT NOT NULL,
                current_step INTEGER NOT NULL DEFAULT 0,
                next_fire_at TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                cart TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sequence_runs_one_follow_up
                ON sequence_runs(workspace_id, client_id)
                WHERE family = 'follow_up' AND status IN ('active', 'paused');
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sequence_runs_one_cart
                ON sequence_runs(conversation_id)
                WHERE family = 'abandoned_cart' AND status IN ('active', 'paused');
            CREATE INDEX IF NOT EXISTS idx_sequence_runs_conversation
                ON sequence_runs(conversation_id, started_at);
        "#,
    },
    Migration {
        version: 3,
        name: "jobs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                run_at TEXT NOT NULL,
                locked_until TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(queue, status, run_at);
        "#,
    },
    Migration {
        version: 4,
        name: "stages",
        sql: r#"
            CREATE TABLE IF NOT EXISTS stages (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                instructions TEXT NOT NULL DEFAULT '',
                required_fields TEXT NOT NULL DEFAULT '[]',
                action TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_stages_workspace ON stages(workspace_id, active);
        "#,
    },
    Migration {
        version: 5,
        name: "sequence_paused_at",
        sql: r#"
            ALTER TABLE sequence_runs ADD COLUMN paused_at TEXT;
        "#,
    },
];

/// Apply all migrations newer than the recorded version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, MIGRATIONS.last().map(|m| m.version).unwrap());
    }

    #[tokio::test]
    async fn migration_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let conn = memory_conn().await;
        let fut = run_migrations(&conn);
        assert_send(&fut);
        fut.await.unwrap();
    }

    #[tokio::test]
    async fn one_open_follow_up_per_client() {
        let conn = memory_conn().await;
        run_migrations(&conn).await.unwrap();
        conn.execute_batch(
            "INSERT INTO workspaces (id, name, created_at) VALUES ('w', 'W', '2025');
             INSERT INTO clients (id, workspace_id, channel, phone_number, created_at, updated_at)
                 VALUES ('c', 'w', 'evolution', '1', '2025', '2025');
             INSERT INTO sequence_runs (id, workspace_id, client_id, family, status, started_at)
                 VALUES ('r1', 'w', 'c', 'follow_up', 'active', '2025');",
        )
        .await
        .unwrap();

        let dup = conn
            .execute(
                "INSERT INTO sequence_runs (id, workspace_id, client_id, family, status, started_at)
                 VALUES ('r2', 'w', 'c', 'follow_up', 'paused', '2025')",
                (),
            )
            .await;
        assert!(dup.is_err());

        // A finished run frees the slot.
        conn.execute("UPDATE sequence_runs SET status = 'completed' WHERE id = 'r1'", ())
            .await
            .unwrap();
        conn.execute(
            "INSERT INTO sequence_runs (id, workspace_id, client_id, family, status, started_at)
             VALUES ('r3', 'w', 'c', 'follow_up', 'active', '2025')",
            (),
        )
        .await
        .unwrap();
    }
}
