use crate::db::EDIT_WINDOW_ABORT;
use crate::error::{ChatError, ChatResult};
use crate::model::{emoji_at, uuid_at, AttachmentRef, Emoji, Message, MessageBody, Reactions, ReplyTo};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, text, attachment_url, attachment_path, \
     attachment_name, attachment_mime, attachment_size, created_at, edited_at, is_pinned, \
     reply_to_id, reply_snippet, reply_sender_label";

fn row_to_msg(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let attachment = match row.get::<_, Option<String>>(4)? {
        Some(url) => Some(AttachmentRef {
            url,
            path: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            file_name: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            mime: row
                .get::<_, Option<String>>(7)?
                .unwrap_or_else(|| "application/octet-stream".into()),
            size_bytes: row.get::<_, Option<i64>>(8)?.unwrap_or_default().max(0) as u64,
        }),
        None => None,
    };
    let body = MessageBody::from_parts(row.get(3)?, attachment)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(3, "text".into(), Type::Null))?;
    let reply_to = match row.get::<_, Option<String>>(12)? {
        Some(_) => Some(ReplyTo {
            message_id: uuid_at(row, 12)?,
            snippet: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
            sender_label: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
        }),
        None => None,
    };
    Ok(Message {
        id: uuid_at(row, 0)?,
        conversation_id: uuid_at(row, 1)?,
        sender_id: row.get(2)?,
        body,
        created_at: row.get(9)?,
        edited_at: row.get(10)?,
        is_pinned: row.get::<_, i64>(11)? != 0,
        reply_to,
        reactions: Reactions::default(),
    })
}

/// Append a message. `created_at` is the later of `now_ms` and one past the
/// newest message of the conversation, so ordering within a conversation is total.
pub fn create_message(
    conn: &Connection,
    now_ms: i64,
    conversation_id: &Uuid,
    sender_id: &str,
    body: MessageBody,
    reply_to: Option<ReplyTo>,
) -> ChatResult<Message> {
    if let MessageBody::Text { text } = &body {
        if text.trim().is_empty() {
            return Err(ChatError::Invalid("empty_message".into()));
        }
    }
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let last: Option<i64> = tx.query_row(
        "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
        [conversation_id.to_string()],
        |row| row.get(0),
    )?;
    let created_at = last.map_or(now_ms, |last| now_ms.max(last + 1));
    let id = Uuid::new_v4();
    let attachment = body.attachment();
    tx.execute(
        &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, 0, ?11, ?12, ?13)"),
        params![
            id.to_string(),
            conversation_id.to_string(),
            sender_id,
            body.text(),
            attachment.map(|a| a.url.as_str()),
            attachment.map(|a| a.path.as_str()),
            attachment.map(|a| a.file_name.as_str()),
            attachment.map(|a| a.mime.as_str()),
            attachment.map(|a| a.size_bytes as i64),
            created_at,
            reply_to.as_ref().map(|r| r.message_id.to_string()),
            reply_to.as_ref().map(|r| r.snippet.as_str()),
            reply_to.as_ref().map(|r| r.sender_label.as_str()),
        ],
    )?;
    tx.commit()?;
    Ok(Message {
        id,
        conversation_id: *conversation_id,
        sender_id: sender_id.into(),
        body,
        created_at,
        edited_at: None,
        is_pinned: false,
        reply_to,
        reactions: Reactions::default(),
    })
}

/// All messages of a conversation ordered by `created_at`, ties broken by id.
pub fn list_messages(conn: &Connection, conversation_id: &Uuid) -> ChatResult<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY created_at ASC, id ASC"
    ))?;
    let mut msgs = stmt
        .query_map([conversation_id.to_string()], row_to_msg)?
        .collect::<Result<Vec<_>, _>>()?;
    let mut reactions = conversation_reactions(conn, conversation_id)?;
    for m in msgs.iter_mut() {
        if let Some(r) = reactions.remove(&m.id) {
            m.reactions = r;
        }
    }
    Ok(msgs)
}

fn conversation_reactions(
    conn: &Connection,
    conversation_id: &Uuid,
) -> ChatResult<HashMap<Uuid, Reactions>> {
    let mut stmt = conn.prepare(
        "SELECT r.message_id, r.emoji, r.user_id FROM message_reactions r \
         JOIN messages m ON m.id = r.message_id WHERE m.conversation_id = ?1",
    )?;
    let mut rows = stmt.query([conversation_id.to_string()])?;
    let mut out: HashMap<Uuid, Reactions> = HashMap::new();
    while let Some(row) = rows.next()? {
        out.entry(uuid_at(row, 0)?)
            .or_default()
            .insert(emoji_at(row, 1)?, row.get(2)?);
    }
    Ok(out)
}

/// A single message including its reactions.
pub fn get_message(
    conn: &Connection,
    conversation_id: &Uuid,
    message_id: &Uuid,
) -> ChatResult<Option<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1 AND conversation_id = ?2"
    ))?;
    let Some(mut msg) = stmt
        .query_row(
            params![message_id.to_string(), conversation_id.to_string()],
            row_to_msg,
        )
        .optional()?
    else {
        return Ok(None);
    };
    let mut stmt =
        conn.prepare("SELECT emoji, user_id FROM message_reactions WHERE message_id = ?1")?;
    let mut rows = stmt.query([message_id.to_string()])?;
    while let Some(row) = rows.next()? {
        msg.reactions.insert(emoji_at(row, 0)?, row.get(1)?);
    }
    Ok(Some(msg))
}

/// Newest message only; reactions are not loaded.
pub fn latest_message(conn: &Connection, conversation_id: &Uuid) -> ChatResult<Option<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1"
    ))?;
    Ok(stmt
        .query_row([conversation_id.to_string()], row_to_msg)
        .optional()?)
}

/// Replace the text of a message. The window is checked first so an expired
/// message reports `EditWindowExpired` to everyone, then authorship.
pub fn edit_message(
    conn: &Connection,
    now_ms: i64,
    edit_window_ms: i64,
    conversation_id: &Uuid,
    message_id: &Uuid,
    sender_id: &str,
    new_text: &str,
) -> ChatResult<Message> {
    let expired = ChatError::EditWindowExpired {
        max_edit_minutes: edit_window_ms / 60_000,
    };
    let msg = get_message(conn, conversation_id, message_id)?.ok_or(ChatError::NotFound)?;
    if now_ms - msg.created_at > edit_window_ms {
        return Err(expired);
    }
    if msg.sender_id != sender_id {
        return Err(ChatError::NotAuthor);
    }
    if !msg.body.is_editable() {
        return Err(ChatError::Invalid("attachments_not_editable".into()));
    }
    let new_text = new_text.trim();
    if new_text.is_empty() {
        return Err(ChatError::Invalid("empty_message".into()));
    }
    let changed = conn
        .execute(
            "UPDATE messages SET text = ?3, edited_at = ?4 WHERE id = ?1 AND conversation_id = ?2 AND sender_id = ?5",
            params![
                message_id.to_string(),
                conversation_id.to_string(),
                new_text,
                now_ms,
                sender_id
            ],
        )
        .map_err(|e| {
            if is_edit_window_abort(&e) {
                expired.clone()
            } else {
                e.into()
            }
        })?;
    if changed == 0 {
        return Err(ChatError::NotFound);
    }
    Ok(Message {
        body: MessageBody::Text {
            text: new_text.into(),
        },
        edited_at: Some(now_ms),
        ..msg
    })
}

fn is_edit_window_abort(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(_, Some(m)) if m.contains(EDIT_WINDOW_ABORT))
}

/// Hard removal; reactions go with it.
pub fn delete_message(
    conn: &Connection,
    conversation_id: &Uuid,
    message_id: &Uuid,
    sender_id: &str,
) -> ChatResult<()> {
    let author: Option<String> = conn
        .query_row(
            "SELECT sender_id FROM messages WHERE id = ?1 AND conversation_id = ?2",
            params![message_id.to_string(), conversation_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match author {
        None => Err(ChatError::NotFound),
        Some(author) if author != sender_id => Err(ChatError::NotAuthor),
        Some(_) => {
            conn.execute(
                "DELETE FROM messages WHERE id = ?1 AND sender_id = ?2",
                params![message_id.to_string(), sender_id],
            )?;
            Ok(())
        }
    }
}

fn ensure_message(conn: &Connection, conversation_id: &Uuid, message_id: &Uuid) -> ChatResult<()> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM messages WHERE id = ?1 AND conversation_id = ?2",
            params![message_id.to_string(), conversation_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    exists.map(|_| ()).ok_or(ChatError::NotFound)
}

/// Flip membership of `user_id` in the emoji's reactor set. Returns whether
/// the user is a reactor afterwards.
pub fn toggle_reaction(
    conn: &Connection,
    conversation_id: &Uuid,
    message_id: &Uuid,
    emoji: Emoji,
    user_id: &str,
) -> ChatResult<bool> {
    ensure_message(conn, conversation_id, message_id)?;
    let removed = conn.execute(
        "DELETE FROM message_reactions WHERE message_id = ?1 AND emoji = ?2 AND user_id = ?3",
        params![message_id.to_string(), emoji.as_str(), user_id],
    )?;
    if removed > 0 {
        return Ok(false);
    }
    conn.execute(
        "INSERT OR IGNORE INTO message_reactions (message_id, emoji, user_id) VALUES (?1, ?2, ?3)",
        params![message_id.to_string(), emoji.as_str(), user_id],
    )?;
    Ok(true)
}

/// Flip the pinned flag in place. Returns the new value.
pub fn toggle_pin(conn: &Connection, conversation_id: &Uuid, message_id: &Uuid) -> ChatResult<bool> {
    let pinned: Option<i64> = conn
        .query_row(
            "UPDATE messages SET is_pinned = 1 - is_pinned WHERE id = ?1 AND conversation_id = ?2 RETURNING is_pinned",
            params![message_id.to_string(), conversation_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    pinned.map(|p| p != 0).ok_or(ChatError::NotFound)
}

/// Blob paths still referenced by some message.
pub fn referenced_blob_paths(conn: &Connection) -> ChatResult<HashSet<String>> {
    let mut stmt =
        conn.prepare("SELECT attachment_path FROM messages WHERE attachment_path IS NOT NULL")?;
    let paths = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seeded_conn, text};

    const WINDOW: i64 = 5 * 60_000;

    #[test]
    fn create_and_validate() {
        let (conn, conv) = seeded_conn();
        assert!(create_message(&conn, 0, &conv.id, "owner", text("  "), None).is_err());
        let m = create_message(&conn, 10, &conv.id, "owner", text("hi"), None).unwrap();
        assert_eq!(m.body.text(), Some("hi"));
        assert_eq!(m.created_at, 10);
    }

    #[test]
    fn timestamps_strictly_increase_within_conversation() {
        let (conn, conv) = seeded_conn();
        let a = create_message(&conn, 100, &conv.id, "owner", text("a"), None).unwrap();
        let b = create_message(&conn, 100, &conv.id, "tester", text("b"), None).unwrap();
        let c = create_message(&conn, 50, &conv.id, "owner", text("c"), None).unwrap();
        assert!(a.created_at < b.created_at && b.created_at < c.created_at);
        let ids: Vec<_> = list_messages(&conn, &conv.id)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn edit_rules() {
        let (conn, conv) = seeded_conn();
        let m = create_message(&conn, 0, &conv.id, "owner", text("hi"), None).unwrap();
        assert_eq!(
            edit_message(&conn, 1_000, WINDOW, &conv.id, &m.id, "tester", "x").unwrap_err(),
            ChatError::NotAuthor
        );
        let edited = edit_message(&conn, 4 * 60_000, WINDOW, &conv.id, &m.id, "owner", "hey").unwrap();
        assert_eq!(edited.body.text(), Some("hey"));
        assert_eq!(edited.edited_at, Some(4 * 60_000));
        assert_eq!(edited.created_at, 0);
        for who in ["owner", "tester"] {
            assert_eq!(
                edit_message(&conn, 6 * 60_000, WINDOW, &conv.id, &m.id, who, "late").unwrap_err(),
                ChatError::EditWindowExpired { max_edit_minutes: 5 }
            );
        }
        let stored = get_message(&conn, &conv.id, &m.id).unwrap().unwrap();
        assert_eq!(stored.body.text(), Some("hey"));
    }

    #[test]
    fn storage_enforces_window_even_if_caller_skips_check() {
        let (conn, conv) = seeded_conn();
        let m = create_message(&conn, 0, &conv.id, "owner", text("hi"), None).unwrap();
        // a wider caller window than the store's does not get past the trigger
        let err = edit_message(&conn, 6 * 60_000, 60 * 60_000, &conv.id, &m.id, "owner", "x")
            .unwrap_err();
        assert!(matches!(err, ChatError::EditWindowExpired { .. }));
    }

    #[test]
    fn delete_is_author_only_and_hard() {
        let (conn, conv) = seeded_conn();
        let m = create_message(&conn, 0, &conv.id, "owner", text("hi"), None).unwrap();
        toggle_reaction(&conn, &conv.id, &m.id, Emoji::Heart, "tester").unwrap();
        assert_eq!(
            delete_message(&conn, &conv.id, &m.id, "tester").unwrap_err(),
            ChatError::NotAuthor
        );
        delete_message(&conn, &conv.id, &m.id, "owner").unwrap();
        assert!(get_message(&conn, &conv.id, &m.id).unwrap().is_none());
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM message_reactions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(left, 0);
        assert_eq!(
            delete_message(&conn, &conv.id, &m.id, "owner").unwrap_err(),
            ChatError::NotFound
        );
    }

    #[test]
    fn reaction_toggle_is_an_involution() {
        let (conn, conv) = seeded_conn();
        let m = create_message(&conn, 0, &conv.id, "owner", text("hi"), None).unwrap();
        assert!(toggle_reaction(&conn, &conv.id, &m.id, Emoji::ThumbsUp, "owner").unwrap());
        assert!(toggle_reaction(&conn, &conv.id, &m.id, Emoji::ThumbsUp, "tester").unwrap());
        let msg = get_message(&conn, &conv.id, &m.id).unwrap().unwrap();
        assert_eq!(msg.reactions.count(Emoji::ThumbsUp), 2);
        assert!(!toggle_reaction(&conn, &conv.id, &m.id, Emoji::ThumbsUp, "owner").unwrap());
        let msg = get_message(&conn, &conv.id, &m.id).unwrap().unwrap();
        assert_eq!(msg.reactions.reactors(Emoji::ThumbsUp).collect::<Vec<_>>(), vec!["tester"]);
        assert!(!toggle_reaction(&conn, &conv.id, &m.id, Emoji::ThumbsUp, "tester").unwrap());
        assert!(get_message(&conn, &conv.id, &m.id).unwrap().unwrap().reactions.is_empty());
    }

    #[test]
    fn pin_flips_symmetrically() {
        let (conn, conv) = seeded_conn();
        let m = create_message(&conn, 0, &conv.id, "owner", text("hi"), None).unwrap();
        assert!(toggle_pin(&conn, &conv.id, &m.id).unwrap());
        assert!(!toggle_pin(&conn, &conv.id, &m.id).unwrap());
        assert_eq!(
            toggle_pin(&conn, &conv.id, &Uuid::new_v4()).unwrap_err(),
            ChatError::NotFound
        );
    }

    #[test]
    fn latest_and_references() {
        let (conn, conv) = seeded_conn();
        assert!(latest_message(&conn, &conv.id).unwrap().is_none());
        create_message(&conn, 0, &conv.id, "owner", text("one"), None).unwrap();
        let attachment = AttachmentRef {
            url: "http://h/api/files/conversations/x/1_a.png".into(),
            path: "conversations/x/1_a.png".into(),
            file_name: "a.png".into(),
            mime: "image/png".into(),
            size_bytes: 4,
        };
        let body = MessageBody::from_parts(None, Some(attachment)).unwrap();
        create_message(&conn, 1, &conv.id, "tester", body, None).unwrap();
        let last = latest_message(&conn, &conv.id).unwrap().unwrap();
        assert_eq!(last.body.preview(20), "📷 Image");
        assert!(referenced_blob_paths(&conn)
            .unwrap()
            .contains("conversations/x/1_a.png"));
    }
}
