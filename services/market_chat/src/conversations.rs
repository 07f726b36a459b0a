//! Conversations and profiles are written by the surrounding marketplace
//! (application acceptance, profile sync). The chat engine only reads them;
//! the upserts here are the hooks those workflows call.

use crate::error::{ChatError, ChatResult};
use crate::model::{uuid_at, Conversation, Counterpart};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

/// Which side of the relationship a lookup matches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Owner,
    Tester,
}

const CONVERSATION_COLUMNS: &str = "id, project_id, project_title, owner_id, tester_id";

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: uuid_at(row, 0)?,
        project_id: row.get(1)?,
        project_title: row.get(2)?,
        owner_id: row.get(3)?,
        tester_id: row.get(4)?,
    })
}

/// Record a conversation created by the acceptance workflow. Existing rows are left untouched.
pub fn insert_conversation(conn: &Connection, conversation: &Conversation) -> ChatResult<()> {
    if conversation.owner_id == conversation.tester_id {
        return Err(ChatError::Invalid("owner and tester must differ".into()));
    }
    conn.execute(
        "INSERT OR IGNORE INTO conversations (id, project_id, project_title, owner_id, tester_id) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            conversation.id.to_string(),
            conversation.project_id,
            conversation.project_title,
            conversation.owner_id,
            conversation.tester_id
        ],
    )?;
    Ok(())
}

pub fn get_conversation(conn: &Connection, id: &Uuid) -> ChatResult<Option<Conversation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"
    ))?;
    Ok(stmt
        .query_row([id.to_string()], row_to_conversation)
        .optional()?)
}

/// Conversations where `user_id` holds the given role.
pub fn conversations_by_role(
    conn: &Connection,
    user_id: &str,
    role: Role,
) -> ChatResult<Vec<Conversation>> {
    let column = match role {
        Role::Owner => "owner_id",
        Role::Tester => "tester_id",
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE {column} = ?1"
    ))?;
    let rows = stmt
        .query_map([user_id], row_to_conversation)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Insert or refresh the display identity of a user.
pub fn upsert_profile(conn: &Connection, profile: &Counterpart) -> ChatResult<()> {
    conn.execute(
        "INSERT INTO profiles (user_id, display_name, avatar_url) VALUES (?1, ?2, ?3) \
         ON CONFLICT(user_id) DO UPDATE SET display_name = excluded.display_name, avatar_url = excluded.avatar_url",
        params![profile.user_id, profile.display_name, profile.avatar_url],
    )?;
    Ok(())
}

pub fn get_profile(conn: &Connection, user_id: &str) -> ChatResult<Option<Counterpart>> {
    let mut stmt =
        conn.prepare("SELECT user_id, display_name, avatar_url FROM profiles WHERE user_id = ?1")?;
    Ok(stmt
        .query_row([user_id], |row| {
            Ok(Counterpart {
                user_id: row.get(0)?,
                display_name: row.get(1)?,
                avatar_url: row.get(2)?,
            })
        })
        .optional()?)
}
