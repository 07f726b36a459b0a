use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Open (or create) a database file and run migrations on a single connection.
pub fn init_db<P: AsRef<Path>>(path: P, edit_window_ms: i64) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(PRAGMAS)?;
    migrate(&conn, edit_window_ms)?;
    Ok(conn)
}

/// Build the shared connection pool and run migrations once.
pub fn open_pool<P: AsRef<Path>>(path: P, edit_window_ms: i64) -> Result<DbPool> {
    let manager =
        SqliteConnectionManager::file(path.as_ref()).with_init(|c| c.execute_batch(PRAGMAS));
    let pool = Pool::builder()
        .max_size(8)
        .build(manager)
        .context("building sqlite pool")?;
    let conn = pool.get()?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    migrate(&conn, edit_window_ms)?;
    Ok(pool)
}

/// Create tables and (re)install the edit window trigger for the configured window.
pub fn migrate(conn: &Connection, edit_window_ms: i64) -> Result<()> {
    conn.execute_batch(SCHEMA).context("applying schema")?;
    conn.execute_batch(&format!(
        "DROP TRIGGER IF EXISTS messages_edit_window;
         CREATE TRIGGER messages_edit_window BEFORE UPDATE OF text ON messages
         WHEN NEW.edited_at IS NOT NULL AND NEW.edited_at - OLD.created_at > {edit_window_ms}
         BEGIN
           SELECT RAISE(ABORT, '{EDIT_WINDOW_ABORT}');
         END;"
    ))
    .context("installing edit window trigger")?;
    Ok(())
}

/// Abort message raised by the storage-level edit window check.
pub const EDIT_WINDOW_ABORT: &str = "edit_window_expired";

const PRAGMAS: &str = "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;";

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
  user_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  avatar_url TEXT
);

CREATE TABLE IF NOT EXISTS conversations (
  id TEXT PRIMARY KEY,
  project_id TEXT NOT NULL,
  project_title TEXT NOT NULL,
  owner_id TEXT NOT NULL,
  tester_id TEXT NOT NULL,
  CHECK (owner_id <> tester_id)
);
CREATE INDEX IF NOT EXISTS conversations_owner ON conversations(owner_id);
CREATE INDEX IF NOT EXISTS conversations_tester ON conversations(tester_id);

CREATE TABLE IF NOT EXISTS messages (
  id TEXT PRIMARY KEY,
  conversation_id TEXT NOT NULL REFERENCES conversations(id),
  sender_id TEXT NOT NULL,
  text TEXT,
  attachment_url TEXT,
  attachment_path TEXT,
  attachment_name TEXT,
  attachment_mime TEXT,
  attachment_size INTEGER,
  created_at INTEGER NOT NULL,
  edited_at INTEGER,
  is_pinned INTEGER NOT NULL DEFAULT 0,
  reply_to_id TEXT,
  reply_snippet TEXT,
  reply_sender_label TEXT,
  CHECK (text IS NOT NULL OR attachment_url IS NOT NULL)
);
CREATE INDEX IF NOT EXISTS messages_by_conversation ON messages(conversation_id, created_at, id);

CREATE TABLE IF NOT EXISTS message_reactions (
  message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
  emoji TEXT NOT NULL,
  user_id TEXT NOT NULL,
  PRIMARY KEY (message_id, emoji, user_id)
);

CREATE TRIGGER IF NOT EXISTS messages_created_at_immutable BEFORE UPDATE OF created_at ON messages
WHEN NEW.created_at <> OLD.created_at
BEGIN
  SELECT RAISE(ABORT, 'created_at_immutable');
END;
"#;
