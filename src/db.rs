use rusqlite::{Connection, Transaction};
use std::sync::{Mutex, MutexGuard};

pub struct Db {
    conn: Mutex<Connection>,
}

/// Strip `sqlite:` URL prefixes so `database_url` accepts both URL and plain
/// path forms (`sqlite:///./relay.db`, `sqlite://relay.db`, `relay.db`).
pub fn database_path(database_url: &str) -> String {
    let path = database_url
        .strip_prefix("sqlite:///")
        .or_else(|| database_url.strip_prefix("sqlite://"))
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    path.to_string()
}

impl Db {
    pub fn open(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` inside a single transaction: committed when `f` returns Ok,
    /// rolled back (on drop) when it errors.
    pub fn with_tx<T, F>(&self, f: F) -> rusqlite::Result<T>
    where
        F: FnOnce(&Transaction) -> rusqlite::Result<T>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn migrate(&self) -> rusqlite::Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_bot_id TEXT NOT NULL,
                chat_message_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                author_name TEXT NOT NULL,
                channel_id TEXT,
                guild_id TEXT,
                is_dm INTEGER NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                dedupe_key TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_bot_message
                ON messages(chat_bot_id, chat_message_id);
            CREATE INDEX IF NOT EXISTS idx_messages_channel_timestamp
                ON messages(channel_id, timestamp);

            CREATE TABLE IF NOT EXISTS deliveries (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                backend_bot_id TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                delivered_at TEXT,
                lease_id TEXT,
                lease_expires_at TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL
            );

            -- Primary FIFO lookup key
            CREATE INDEX IF NOT EXISTS idx_deliveries_backend_state_created
                ON deliveries(backend_bot_id, state, created_at);
            -- Reaper scan
            CREATE INDEX IF NOT EXISTS idx_deliveries_state_expiry
                ON deliveries(state, lease_expires_at);

            CREATE TABLE IF NOT EXISTS webhook_nudges (
                id TEXT PRIMARY KEY,
                backend_bot_id TEXT NOT NULL UNIQUE,
                chat_bot_id TEXT,
                last_dedupe_key TEXT,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TEXT NOT NULL,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_webhook_nudges_state_next
                ON webhook_nudges(state, next_attempt_at);",
        )?;
        Ok(())
    }
}
