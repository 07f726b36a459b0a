//! Per-client view of one open conversation: the live message set, its
//! rendered decorations, and the composer (draft, staged attachment, and at
//! most one of replying / editing).

use crate::error::{ChatError, ChatResult};
use crate::feed::{FeedEvent, MessageFeed};
use crate::model::{
    AttachmentRef, ComposerMode, ComposerState, Conversation, Counterpart, Emoji, Message,
    ReactionBadge, RenderedMessage, UploadFile, UserId,
};
use crate::service::{ChatService, EditMessage, OpenedConversation, SendMessage};
use uuid::Uuid;

/// Outcome of waiting on the open conversation's feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The message set was replaced; re-render.
    Messages,
    /// The subscription failed and the conversation was closed.
    Failed(ChatError),
}

struct OpenState {
    conversation: Conversation,
    counterpart: Counterpart,
    feed: MessageFeed,
    messages: Vec<Message>,
}

pub struct ConversationSession {
    service: ChatService,
    user_id: UserId,
    open: Option<OpenState>,
    composer: ComposerState,
}

fn no_conversation() -> ChatError {
    ChatError::Invalid("no_open_conversation".into())
}

impl ConversationSession {
    pub fn new(service: ChatService, user_id: UserId) -> Self {
        Self {
            service,
            user_id,
            open: None,
            composer: ComposerState::default(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.open.as_ref().map(|o| &o.conversation)
    }

    pub fn counterpart(&self) -> Option<&Counterpart> {
        self.open.as_ref().map(|o| &o.counterpart)
    }

    pub fn messages(&self) -> &[Message] {
        self.open
            .as_ref()
            .map(|o| o.messages.as_slice())
            .unwrap_or_default()
    }

    pub fn composer(&self) -> &ComposerState {
        &self.composer
    }

    fn open_id(&self) -> ChatResult<Uuid> {
        self.open
            .as_ref()
            .map(|o| o.conversation.id)
            .ok_or_else(no_conversation)
    }

    /// Switch to a conversation. The previous subscription is released before
    /// the new one is taken, and a rejected open leaves nothing open.
    pub async fn open(&mut self, conversation_id: Uuid) -> ChatResult<OpenedConversation> {
        self.close();
        let opened = self
            .service
            .open_conversation(conversation_id, &self.user_id)
            .await?;
        let feed = self
            .service
            .subscribe_messages(conversation_id, &self.user_id)
            .await?;
        self.open = Some(OpenState {
            conversation: opened.conversation.clone(),
            counterpart: opened.counterpart.clone(),
            feed,
            messages: Vec::new(),
        });
        tracing::debug!(user = %self.user_id, conversation = %conversation_id, "conversation opened");
        Ok(opened)
    }

    /// Returns whether a conversation was open.
    pub fn close(&mut self) -> bool {
        self.composer = ComposerState::default();
        self.open.take().is_some()
    }

    /// Wait for the next feed delivery. `None` when nothing is open.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        let open = self.open.as_mut()?;
        match open.feed.next().await {
            Some(FeedEvent::Snapshot(messages)) => {
                open.messages = messages;
                if let ComposerMode::Editing { message_id } = self.composer.mode {
                    if !open.messages.iter().any(|m| m.id == message_id) {
                        self.composer = ComposerState::default();
                    }
                }
                Some(SessionUpdate::Messages)
            }
            Some(FeedEvent::Failed(e)) => {
                self.close();
                Some(SessionUpdate::Failed(e))
            }
            None => {
                self.close();
                Some(SessionUpdate::Failed(ChatError::Subscription(
                    "feed ended".into(),
                )))
            }
        }
    }

    /// The message set decorated for this user, oldest first.
    pub fn render(&self) -> Vec<RenderedMessage> {
        let now = self.service.now_ms();
        let window = self.service.edit_window_ms();
        self.messages()
            .iter()
            .map(|m| {
                let mine = m.sender_id == self.user_id;
                let badges = Emoji::ALL
                    .iter()
                    .filter(|e| m.reactions.count(**e) > 0)
                    .map(|&emoji| ReactionBadge {
                        emoji,
                        count: m.reactions.count(emoji),
                        reacted_by_me: m.reactions.contains(emoji, &self.user_id),
                    })
                    .collect();
                RenderedMessage {
                    mine,
                    can_edit: mine && m.body.is_editable() && now - m.created_at <= window,
                    edited: m.edited_at.is_some(),
                    badges,
                    message: m.clone(),
                }
            })
            .collect()
    }

    /// Ids of pinned messages in display order.
    pub fn pinned(&self) -> Vec<Uuid> {
        self.messages()
            .iter()
            .filter(|m| m.is_pinned)
            .map(|m| m.id)
            .collect()
    }

    pub fn set_draft(&mut self, text: String) {
        self.composer.draft = text;
    }

    /// Attach an already uploaded file to the next send.
    pub fn stage(&mut self, attachment: AttachmentRef) -> ChatResult<()> {
        self.open_id()?;
        if matches!(self.composer.mode, ComposerMode::Editing { .. }) {
            return Err(ChatError::Invalid("attachments_not_editable".into()));
        }
        self.composer.staged = Some(attachment);
        Ok(())
    }

    /// Upload through the attachment pipeline, then stage the result.
    pub async fn attach(&mut self, file: UploadFile) -> ChatResult<AttachmentRef> {
        let conversation_id = self.open_id()?;
        let attachment = self
            .service
            .upload_attachment(conversation_id, &self.user_id, file)
            .await?;
        self.stage(attachment.clone())?;
        Ok(attachment)
    }

    pub fn unstage(&mut self) {
        self.composer.staged = None;
    }

    fn find(&self, message_id: &Uuid) -> ChatResult<&Message> {
        self.messages()
            .iter()
            .find(|m| m.id == *message_id)
            .ok_or(ChatError::NotFound)
    }

    /// Quote a message in the next send. Leaves edit mode. The composer shows
    /// the same quote the server will store.
    pub async fn start_reply(&mut self, message_id: Uuid) -> ChatResult<()> {
        let conversation_id = self.open_id()?;
        self.find(&message_id)?;
        let target = self
            .service
            .reply_preview(conversation_id, message_id, &self.user_id)
            .await?;
        if matches!(self.composer.mode, ComposerMode::Editing { .. }) {
            self.composer.draft.clear();
        }
        self.composer.mode = ComposerMode::Replying { target };
        Ok(())
    }

    /// Load one of the user's own text messages into the composer. Leaves reply mode.
    pub fn start_edit(&mut self, message_id: Uuid) -> ChatResult<()> {
        let now = self.service.now_ms();
        let window = self.service.edit_window_ms();
        let target = self.find(&message_id)?;
        if now - target.created_at > window {
            return Err(ChatError::EditWindowExpired {
                max_edit_minutes: window / 60_000,
            });
        }
        if target.sender_id != self.user_id {
            return Err(ChatError::NotAuthor);
        }
        let text = target
            .body
            .is_editable()
            .then(|| target.body.text().unwrap_or_default().to_string())
            .ok_or_else(|| ChatError::Invalid("attachments_not_editable".into()))?;
        self.composer = ComposerState {
            draft: text,
            staged: None,
            mode: ComposerMode::Editing { message_id },
        };
        Ok(())
    }

    /// Leave reply or edit mode. An edit draft is discarded.
    pub fn cancel(&mut self) {
        if matches!(self.composer.mode, ComposerMode::Editing { .. }) {
            self.composer.draft.clear();
        }
        self.composer.mode = ComposerMode::Idle;
    }

    /// Edit when an edit is in progress, send otherwise. The composer is reset
    /// only on success so a failed submit can be retried.
    pub async fn submit(&mut self) -> ChatResult<Message> {
        let conversation_id = self.open_id()?;
        let composer = self.composer.clone();
        let message = match composer.mode {
            ComposerMode::Editing { message_id } => {
                self.service
                    .edit_message(EditMessage {
                        conversation_id,
                        message_id,
                        sender_id: self.user_id.clone(),
                        new_text: composer.draft,
                    })
                    .await?
            }
            mode => {
                let reply_to = match mode {
                    ComposerMode::Replying { target } => Some(target.message_id),
                    _ => None,
                };
                self.service
                    .send_message(SendMessage {
                        conversation_id,
                        sender_id: self.user_id.clone(),
                        text: Some(composer.draft),
                        attachment: composer.staged,
                        reply_to,
                    })
                    .await?
            }
        };
        self.composer = ComposerState::default();
        Ok(message)
    }

    pub async fn react(&mut self, message_id: Uuid, emoji: Emoji) -> ChatResult<bool> {
        let conversation_id = self.open_id()?;
        self.service
            .toggle_reaction(conversation_id, message_id, &self.user_id, emoji)
            .await
    }

    pub async fn pin(&mut self, message_id: Uuid) -> ChatResult<bool> {
        let conversation_id = self.open_id()?;
        self.service
            .toggle_pin(conversation_id, message_id, &self.user_id)
            .await
    }

    pub async fn delete(&mut self, message_id: Uuid) -> ChatResult<()> {
        let conversation_id = self.open_id()?;
        self.service
            .delete_message(conversation_id, message_id, &self.user_id)
            .await?;
        if self.composer.mode == (ComposerMode::Editing { message_id }) {
            self.cancel();
        }
        Ok(())
    }
}
