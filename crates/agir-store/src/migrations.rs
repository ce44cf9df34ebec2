use anyhow::Result;
use rusqlite::Connection;
use std::collections::HashSet;

type Migration = (i64, &'static str);

fn migrations() -> Vec<Migration> {
    vec![
        (
            1,
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                model TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scenarios (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                learner_role TEXT,
                objective TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS roles (
                id TEXT PRIMARY KEY,
                scenario_id TEXT NOT NULL REFERENCES scenarios(id),
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                model TEXT,
                UNIQUE(scenario_id, name)
            );

            CREATE TABLE IF NOT EXISTS states (
                id TEXT PRIMARY KEY,
                scenario_id TEXT NOT NULL REFERENCES scenarios(id),
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                UNIQUE(scenario_id, name)
            );

            CREATE TABLE IF NOT EXISTS state_roles (
                state_id TEXT NOT NULL REFERENCES states(id),
                role_id TEXT NOT NULL REFERENCES roles(id),
                position INTEGER NOT NULL,
                PRIMARY KEY(state_id, role_id)
            );

            CREATE TABLE IF NOT EXISTS transitions (
                id TEXT PRIMARY KEY,
                scenario_id TEXT NOT NULL REFERENCES scenarios(id),
                from_state_id TEXT NOT NULL REFERENCES states(id),
                to_state_id TEXT NOT NULL REFERENCES states(id),
                condition TEXT,
                UNIQUE(scenario_id, from_state_id, to_state_id)
            );

            CREATE INDEX IF NOT EXISTS idx_transitions_from ON transitions(from_state_id);
            "#,
        ),
        (
            2,
            r#"
            CREATE TABLE IF NOT EXISTS episodes (
                id TEXT PRIMARY KEY,
                scenario_id TEXT NOT NULL REFERENCES scenarios(id),
                learner_id TEXT NOT NULL REFERENCES users(id),
                status TEXT NOT NULL,
                current_state_id TEXT,
                last_completed_state_id TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_assignments (
                id TEXT PRIMARY KEY,
                role_id TEXT NOT NULL REFERENCES roles(id),
                episode_id TEXT NOT NULL REFERENCES episodes(id),
                user_id TEXT NOT NULL REFERENCES users(id),
                created_at TEXT NOT NULL,
                UNIQUE(role_id, episode_id)
            );

            CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                episode_id TEXT NOT NULL REFERENCES episodes(id),
                state_id TEXT NOT NULL REFERENCES states(id),
                user_id TEXT,
                status TEXT NOT NULL,
                output TEXT,
                conversation_id TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                episode_id TEXT NOT NULL REFERENCES episodes(id),
                state_id TEXT NOT NULL REFERENCES states(id),
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                sender_id TEXT NOT NULL REFERENCES users(id),
                content TEXT NOT NULL,
                seq INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(conversation_id, seq)
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_scenario ON episodes(scenario_id);
            CREATE INDEX IF NOT EXISTS idx_assignments_user ON agent_assignments(user_id);
            CREATE INDEX IF NOT EXISTS idx_steps_episode ON steps(episode_id);
            "#,
        ),
        (
            3,
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                content TEXT NOT NULL,
                importance REAL NOT NULL,
                source TEXT NOT NULL,
                episode_id TEXT,
                scenario_id TEXT,
                document TEXT,
                access_count INTEGER NOT NULL DEFAULT 0,
                last_accessed TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_memories_user_created ON memories(user_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_memories_episode ON memories(episode_id);

            CREATE TABLE IF NOT EXISTS embedding_cache (
                namespace TEXT NOT NULL,
                text_hash TEXT NOT NULL,
                vector BLOB NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (namespace, text_hash)
            );
            "#,
        ),
    ]
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS __schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )?;

    let mut stmt = conn.prepare("SELECT version FROM __schema_version")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    let mut applied = HashSet::new();
    for row in rows {
        applied.insert(row?);
    }

    for (version, sql) in migrations() {
        if applied.contains(&version) {
            continue;
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO __schema_version(version, applied_at) VALUES (?1, datetime('now'))",
            [version],
        )?;
        tx.commit()?;
    }

    Ok(())
}
