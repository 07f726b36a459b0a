pub use chat_api::{
    AttachmentRef, ClientAction, ComposerMode, ComposerState, Conversation, ConversationSummary,
    Counterpart, Emoji, Message, MessageBody, ReactionBadge, Reactions, RenderedMessage, ReplyTo,
    ServerEvent, UserId,
};
use rusqlite::types::Type;
use uuid::Uuid;

/// Maximum characters kept in reply snippets and directory previews.
pub const PREVIEW_CHARS: usize = 100;

/// Binary payload selected for upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub file_name: String,
    pub data: bytes::Bytes,
}

/// Read a TEXT column holding a UUID.
pub(crate) fn uuid_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn emoji_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Emoji> {
    let raw: String = row.get(idx)?;
    raw.parse::<Emoji>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
