use crate::conversations::{conversations_by_role, get_profile, Role};
use crate::error::ChatResult;
use crate::messages::latest_message;
use crate::model::{Conversation, ConversationSummary, Counterpart, PREVIEW_CHARS};
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::warn;

/// Conversations where the user is owner or tester, each listed once.
pub fn participant_conversations(conn: &Connection, user_id: &str) -> ChatResult<Vec<Conversation>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for role in [Role::Owner, Role::Tester] {
        for conv in conversations_by_role(conn, user_id, role)? {
            if seen.insert(conv.id) {
                out.push(conv);
            }
        }
    }
    Ok(out)
}

/// Resolve the counterpart of `viewer`, falling back to a placeholder.
pub fn resolve_counterpart(conn: &Connection, conversation: &Conversation, viewer: &str) -> Counterpart {
    let other = conversation.counterpart_of(viewer).unwrap_or_default();
    match get_profile(conn, other) {
        Ok(Some(profile)) => profile,
        Ok(None) => Counterpart::placeholder(other),
        Err(e) => {
            warn!(conversation = %conversation.id, error = %e, "profile lookup failed");
            Counterpart::placeholder(other)
        }
    }
}

/// Enrich one conversation for the directory. Lookup failures degrade the
/// entry instead of failing the listing.
pub fn summarize(conn: &Connection, conversation: &Conversation, viewer: &str) -> ConversationSummary {
    let counterpart = resolve_counterpart(conn, conversation, viewer);
    let last = match latest_message(conn, &conversation.id) {
        Ok(last) => last,
        Err(e) => {
            warn!(conversation = %conversation.id, error = %e, "last message lookup failed");
            None
        }
    };
    ConversationSummary {
        id: conversation.id,
        project_title: conversation.project_title.clone(),
        counterpart,
        last_message: last.as_ref().map(|m| m.body.preview(PREVIEW_CHARS)),
        last_message_at: last.map(|m| m.created_at),
    }
}

/// Newest activity first; conversations without messages count as time zero.
pub fn sort_summaries(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|a, b| {
        b.last_message_at
            .unwrap_or(0)
            .cmp(&a.last_message_at.unwrap_or(0))
            .then_with(|| a.id.cmp(&b.id))
    });
}
