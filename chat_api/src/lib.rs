use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier handed out by the external identity provider.
pub type UserId = String;

/// A two-party conversation tied to one accepted project relationship.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    pub project_id: String,
    pub project_title: String,
    pub owner_id: UserId,
    pub tester_id: UserId,
}

impl Conversation {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.owner_id == user_id || self.tester_id == user_id
    }

    /// The other participant, or `None` when `user_id` is not part of the conversation.
    pub fn counterpart_of(&self, user_id: &str) -> Option<&str> {
        if self.owner_id == user_id {
            Some(&self.tester_id)
        } else if self.tester_id == user_id {
            Some(&self.owner_id)
        } else {
            None
        }
    }
}

/// Display identity of the other participant.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Counterpart {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl Counterpart {
    /// Identity used when the profile lookup fails or the profile is missing.
    pub fn placeholder(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: "Unknown user".into(),
            avatar_url: None,
        }
    }
}

/// Durable reference to an uploaded blob.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub url: String,
    pub path: String,
    pub file_name: String,
    pub mime: String,
    pub size_bytes: u64,
}

impl AttachmentRef {
    pub fn is_image(&self) -> bool {
        self.mime.starts_with("image/")
    }
}

/// Immutable copy of the quoted message taken at reply time.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReplyTo {
    pub message_id: Uuid,
    pub snippet: String,
    pub sender_label: String,
}

/// Content of a message. A message always carries text, an attachment, or both.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        text: String,
    },
    Attachment {
        attachment: AttachmentRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl MessageBody {
    /// Build a body from optional parts. Text is trimmed and blank text counts
    /// as absent; returns `None` when nothing is left.
    pub fn from_parts(text: Option<String>, attachment: Option<AttachmentRef>) -> Option<Self> {
        let text = text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        match (text, attachment) {
            (text, Some(attachment)) => Some(Self::Attachment {
                attachment,
                caption: text,
            }),
            (Some(text), None) => Some(Self::Text { text }),
            (None, None) => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Attachment { caption, .. } => caption.as_deref(),
        }
    }

    pub fn attachment(&self) -> Option<&AttachmentRef> {
        match self {
            Self::Text { .. } => None,
            Self::Attachment { attachment, .. } => Some(attachment),
        }
    }

    /// Only plain text messages may be edited.
    pub fn is_editable(&self) -> bool {
        matches!(self, Self::Text { .. })
    }

    /// Short preview used for reply snippets and directory summaries.
    pub fn preview(&self, max_chars: usize) -> String {
        match self.text() {
            Some(text) => truncate(text, max_chars),
            None if self.attachment().is_some_and(AttachmentRef::is_image) => "📷 Image".into(),
            None => "📎 Attachment".into(),
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// Fixed set of reactions offered by the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Emoji {
    #[serde(rename = "👍")]
    ThumbsUp,
    #[serde(rename = "❤️")]
    Heart,
    #[serde(rename = "😂")]
    Laugh,
    #[serde(rename = "😮")]
    Surprised,
    #[serde(rename = "😢")]
    Sad,
    #[serde(rename = "🎉")]
    Party,
}

impl Emoji {
    pub const ALL: [Emoji; 6] = [
        Emoji::ThumbsUp,
        Emoji::Heart,
        Emoji::Laugh,
        Emoji::Surprised,
        Emoji::Sad,
        Emoji::Party,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emoji::ThumbsUp => "👍",
            Emoji::Heart => "❤️",
            Emoji::Laugh => "😂",
            Emoji::Surprised => "😮",
            Emoji::Sad => "😢",
            Emoji::Party => "🎉",
        }
    }
}

impl fmt::Display for Emoji {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEmoji(pub String);

impl fmt::Display for UnknownEmoji {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported reaction {:?}", self.0)
    }
}

impl std::error::Error for UnknownEmoji {}

impl FromStr for Emoji {
    type Err = UnknownEmoji;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Emoji::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| UnknownEmoji(s.to_string()))
    }
}

/// Reactor sets keyed by emoji. Empty sets are never stored.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct Reactions(BTreeMap<Emoji, BTreeSet<UserId>>);

impl Reactions {
    pub fn insert(&mut self, emoji: Emoji, user_id: UserId) {
        self.0.entry(emoji).or_default().insert(user_id);
    }

    pub fn reactors(&self, emoji: Emoji) -> impl Iterator<Item = &str> {
        self.0.get(&emoji).into_iter().flatten().map(String::as_str)
    }

    pub fn contains(&self, emoji: Emoji, user_id: &str) -> bool {
        self.0.get(&emoji).is_some_and(|set| set.contains(user_id))
    }

    pub fn count(&self, emoji: Emoji) -> usize {
        self.0.get(&emoji).map_or(0, BTreeSet::len)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Emoji, &BTreeSet<UserId>)> {
        self.0.iter().map(|(e, set)| (*e, set))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One message of a conversation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: UserId,
    #[serde(flatten)]
    pub body: MessageBody,
    pub created_at: i64,
    pub edited_at: Option<i64>,
    pub is_pinned: bool,
    pub reply_to: Option<ReplyTo>,
    #[serde(default)]
    pub reactions: Reactions,
}

/// Directory entry for one conversation, derived on every listing.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub project_title: String,
    pub counterpart: Counterpart,
    pub last_message: Option<String>,
    pub last_message_at: Option<i64>,
}

/// Reaction chip shown under a rendered message.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReactionBadge {
    pub emoji: Emoji,
    pub count: usize,
    pub reacted_by_me: bool,
}

/// A message decorated for the viewing user.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    #[serde(flatten)]
    pub message: Message,
    pub mine: bool,
    pub can_edit: bool,
    pub edited: bool,
    pub badges: Vec<ReactionBadge>,
}

/// What the composer submits to.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ComposerMode {
    #[default]
    Idle,
    Replying {
        target: ReplyTo,
    },
    Editing {
        message_id: Uuid,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct ComposerState {
    pub draft: String,
    pub staged: Option<AttachmentRef>,
    #[serde(flatten)]
    pub mode: ComposerMode,
}

/// Actions a client sends over the live session socket.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    Open { conversation_id: Uuid },
    Close,
    Draft { text: String },
    Stage { attachment: AttachmentRef },
    Unstage,
    Reply { message_id: Uuid },
    Edit { message_id: Uuid },
    Cancel,
    Submit,
    React { message_id: Uuid, emoji: Emoji },
    Pin { message_id: Uuid },
    Delete { message_id: Uuid },
}

/// Events the server pushes over the live session socket.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerEvent {
    Hello {
        user_id: UserId,
    },
    Opened {
        conversation: Conversation,
        counterpart: Counterpart,
    },
    Snapshot {
        conversation_id: Uuid,
        messages: Vec<RenderedMessage>,
        pinned: Vec<Uuid>,
    },
    Composer {
        composer: ComposerState,
    },
    Notice {
        code: String,
        retryable: bool,
    },
    Closed,
}
