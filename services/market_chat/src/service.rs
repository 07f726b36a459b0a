use crate::attachments::{AttachmentPipeline, BlobStore, StoredBlob};
use crate::clock::Clock;
use crate::conversations::{get_conversation, get_profile};
use crate::db::DbPool;
use crate::directory::{participant_conversations, resolve_counterpart, sort_summaries, summarize};
use crate::error::{ChatError, ChatResult};
use crate::feed::{FeedHub, MessageFeed};
use crate::messages;
use crate::model::{
    AttachmentRef, Conversation, ConversationSummary, Counterpart, Emoji, Message, MessageBody,
    ReplyTo, UploadFile, PREVIEW_CHARS,
};
use rusqlite::Connection;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Result of opening a conversation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OpenedConversation {
    pub conversation: Conversation,
    pub counterpart: Counterpart,
}

#[derive(Debug, Clone, Default)]
pub struct SendMessage {
    pub conversation_id: Uuid,
    pub sender_id: String,
    pub text: Option<String>,
    pub attachment: Option<AttachmentRef>,
    /// Message being quoted. Its snippet is captured at send time.
    pub reply_to: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct EditMessage {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub sender_id: String,
    pub new_text: String,
}

/// Authorized entry point to every chat operation. Every mutation is
/// published to the feed hub once it has been committed.
#[derive(Clone)]
pub struct ChatService {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    feed: FeedHub,
    attachments: AttachmentPipeline,
    edit_window_ms: i64,
}

/// Load the conversation and check that `user_id` is one of its two participants.
fn authorize(conn: &Connection, conversation_id: &Uuid, user_id: &str) -> ChatResult<Conversation> {
    let conversation = get_conversation(conn, conversation_id)?.ok_or(ChatError::NotFound)?;
    if !conversation.is_participant(user_id) {
        return Err(ChatError::NotParticipant);
    }
    Ok(conversation)
}

impl ChatService {
    pub fn new(
        pool: DbPool,
        clock: Arc<dyn Clock>,
        blobs: Arc<dyn BlobStore>,
        max_upload_bytes: u64,
        edit_window_ms: i64,
    ) -> Self {
        Self {
            feed: FeedHub::new(pool.clone()),
            attachments: AttachmentPipeline::new(blobs, clock.clone(), max_upload_bytes),
            pool,
            clock,
            edit_window_ms,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn feed(&self) -> &FeedHub {
        &self.feed
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn edit_window_ms(&self) -> i64 {
        self.edit_window_ms
    }

    async fn with_conn<T, F>(&self, f: F) -> ChatResult<T>
    where
        F: FnOnce(&Connection) -> ChatResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await?
    }

    /// Directory of the user's conversations, most recent activity first.
    pub async fn list_conversations(&self, user_id: &str) -> ChatResult<Vec<ConversationSummary>> {
        let user = user_id.to_string();
        let conversations = self
            .with_conn(move |conn| participant_conversations(conn, &user))
            .await?;
        let lookups = conversations.into_iter().map(|conversation| {
            let user = user_id.to_string();
            self.with_conn(move |conn| Ok(summarize(conn, &conversation, &user)))
        });
        let mut summaries = futures::future::join_all(lookups)
            .await
            .into_iter()
            .collect::<ChatResult<Vec<_>>>()?;
        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    pub async fn open_conversation(
        &self,
        conversation_id: Uuid,
        user_id: &str,
    ) -> ChatResult<OpenedConversation> {
        let user = user_id.to_string();
        self.with_conn(move |conn| {
            let conversation = authorize(conn, &conversation_id, &user)?;
            let counterpart = resolve_counterpart(conn, &conversation, &user);
            Ok(OpenedConversation {
                conversation,
                counterpart,
            })
        })
        .await
    }

    /// Current ordered message set.
    pub async fn messages(&self, conversation_id: Uuid, user_id: &str) -> ChatResult<Vec<Message>> {
        let user = user_id.to_string();
        self.with_conn(move |conn| {
            authorize(conn, &conversation_id, &user)?;
            messages::list_messages(conn, &conversation_id)
        })
        .await
    }

    /// Live feed of the conversation. Drop the handle to unsubscribe.
    pub async fn subscribe_messages(&self, conversation_id: Uuid, user_id: &str) -> ChatResult<MessageFeed> {
        let user = user_id.to_string();
        self.with_conn(move |conn| authorize(conn, &conversation_id, &user).map(|_| ()))
            .await?;
        Ok(self.feed.subscribe(conversation_id))
    }

    /// Attachment references are rebuilt from the stored blob; only uploads
    /// into this conversation are accepted.
    pub async fn send_message(&self, req: SendMessage) -> ChatResult<Message> {
        let conversation_id = req.conversation_id;
        let sender = req.sender_id;
        let attachment = match req.attachment {
            Some(claimed) => {
                let user = sender.clone();
                self.with_conn(move |conn| authorize(conn, &conversation_id, &user).map(|_| ()))
                    .await?;
                Some(self.attachments.verify(&conversation_id, &claimed).await?)
            }
            None => None,
        };
        let body = MessageBody::from_parts(req.text, attachment)
            .ok_or_else(|| ChatError::Invalid("empty_message".into()))?;
        let now = self.clock.now_ms();
        let reply_target = req.reply_to;
        let msg = self
            .with_conn(move |conn| {
                authorize(conn, &conversation_id, &sender)?;
                let reply_to = match reply_target {
                    Some(target_id) => Some(reply_snapshot(conn, &conversation_id, &target_id)?),
                    None => None,
                };
                messages::create_message(conn, now, &conversation_id, &sender, body, reply_to)
            })
            .await?;
        debug!(conversation = %conversation_id, message = %msg.id, "message sent");
        self.feed.publish(conversation_id);
        Ok(msg)
    }

    pub async fn edit_message(&self, req: EditMessage) -> ChatResult<Message> {
        let now = self.clock.now_ms();
        let window = self.edit_window_ms;
        let EditMessage {
            conversation_id,
            message_id,
            sender_id,
            new_text,
        } = req;
        let msg = self
            .with_conn(move |conn| {
                authorize(conn, &conversation_id, &sender_id)?;
                messages::edit_message(
                    conn,
                    now,
                    window,
                    &conversation_id,
                    &message_id,
                    &sender_id,
                    &new_text,
                )
            })
            .await?;
        debug!(conversation = %conversation_id, message = %message_id, "message edited");
        self.feed.publish(conversation_id);
        Ok(msg)
    }

    pub async fn delete_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        sender_id: &str,
    ) -> ChatResult<()> {
        let sender = sender_id.to_string();
        self.with_conn(move |conn| {
            authorize(conn, &conversation_id, &sender)?;
            messages::delete_message(conn, &conversation_id, &message_id, &sender)
        })
        .await?;
        debug!(conversation = %conversation_id, message = %message_id, "message deleted");
        self.feed.publish(conversation_id);
        Ok(())
    }

    /// Returns whether the user reacts with `emoji` afterwards.
    pub async fn toggle_reaction(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: &str,
        emoji: Emoji,
    ) -> ChatResult<bool> {
        let user = user_id.to_string();
        let active = self
            .with_conn(move |conn| {
                authorize(conn, &conversation_id, &user)?;
                messages::toggle_reaction(conn, &conversation_id, &message_id, emoji, &user)
            })
            .await?;
        debug!(conversation = %conversation_id, message = %message_id, %emoji, active, "reaction toggled");
        self.feed.publish(conversation_id);
        Ok(active)
    }

    /// Returns the new pinned state.
    pub async fn toggle_pin(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: &str,
    ) -> ChatResult<bool> {
        let user = user_id.to_string();
        let pinned = self
            .with_conn(move |conn| {
                authorize(conn, &conversation_id, &user)?;
                messages::toggle_pin(conn, &conversation_id, &message_id)
            })
            .await?;
        debug!(conversation = %conversation_id, message = %message_id, pinned, "pin toggled");
        self.feed.publish(conversation_id);
        Ok(pinned)
    }

    pub async fn upload_attachment(
        &self,
        conversation_id: Uuid,
        user_id: &str,
        file: UploadFile,
    ) -> ChatResult<AttachmentRef> {
        let size = file.data.len() as u64;
        if size > self.attachments.max_bytes() {
            return Err(ChatError::SizeExceeded {
                size,
                limit: self.attachments.max_bytes(),
            });
        }
        let user = user_id.to_string();
        self.with_conn(move |conn| authorize(conn, &conversation_id, &user).map(|_| ()))
            .await?;
        self.attachments.upload(&conversation_id, file).await
    }

    /// The quote a reply to `message_id` would carry if sent now.
    pub async fn reply_preview(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: &str,
    ) -> ChatResult<ReplyTo> {
        let user = user_id.to_string();
        self.with_conn(move |conn| {
            authorize(conn, &conversation_id, &user)?;
            reply_snapshot(conn, &conversation_id, &message_id)
        })
        .await
    }

    /// Size and content type of a stored blob.
    pub async fn stored_blob(&self, path: &str) -> ChatResult<Option<StoredBlob>> {
        self.attachments
            .inspect(path)
            .await
            .map_err(|e| ChatError::Store(e.to_string()))
    }

    /// Whether `user_id` may read blobs stored under `path`.
    pub async fn can_read_blob(&self, path: &str, user_id: &str) -> ChatResult<bool> {
        let Some(conversation_id) = path
            .strip_prefix("conversations/")
            .and_then(|rest| rest.split('/').next())
            .and_then(|id| Uuid::parse_str(id).ok())
        else {
            return Ok(false);
        };
        let found = self
            .with_conn(move |conn| get_conversation(conn, &conversation_id))
            .await?;
        Ok(found.is_some_and(|c| c.is_participant(user_id)))
    }
}

/// Frozen copy of the quoted message. Later edits or deletion do not touch it.
fn reply_snapshot(conn: &Connection, conversation_id: &Uuid, target_id: &Uuid) -> ChatResult<ReplyTo> {
    let target = messages::get_message(conn, conversation_id, target_id)?
        .ok_or_else(|| ChatError::Invalid("reply_target_missing".into()))?;
    let sender_label = get_profile(conn, &target.sender_id)?
        .unwrap_or_else(|| Counterpart::placeholder(&target.sender_id))
        .display_name;
    Ok(ReplyTo {
        message_id: target.id,
        snippet: target.body.preview(PREVIEW_CHARS),
        sender_label,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedEvent;
    use crate::test_support::{test_service, TestEnv};
    use bytes::Bytes;
    use std::time::Duration;

    fn send(env: &TestEnv, sender: &str, text: &str) -> SendMessage {
        SendMessage {
            conversation_id: env.conversation.id,
            sender_id: sender.into(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reply_snapshot_survives_deletion_of_quoted_message() {
        let env = test_service();
        let hi = env.service.send_message(send(&env, "owner", "Hi")).await.unwrap();
        env.clock.advance(Duration::from_secs(1));
        let reply = env
            .service
            .send_message(SendMessage {
                reply_to: Some(hi.id),
                ..send(&env, "tester", "Hello back")
            })
            .await
            .unwrap();
        assert!(reply.created_at > hi.created_at);
        env.service
            .delete_message(env.conversation.id, hi.id, "owner")
            .await
            .unwrap();

        let all = env.service.messages(env.conversation.id, "tester").await.unwrap();
        assert_eq!(all.len(), 1);
        let quoted = all[0].reply_to.as_ref().unwrap();
        assert_eq!(quoted.message_id, hi.id);
        assert_eq!(quoted.snippet, "Hi");
        assert_eq!(quoted.sender_label, "Olivia Owner");
    }

    #[tokio::test]
    async fn oversize_upload_creates_nothing() {
        let env = test_service();
        let file = UploadFile {
            file_name: "photo.jpg".into(),
            data: Bytes::from(vec![0u8; 12 * 1024 * 1024]),
        };
        let err = env
            .service
            .upload_attachment(env.conversation.id, "owner", file)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::SizeExceeded { .. }));
        assert!(env.blob_root().read_dir().map_or(true, |mut d| d.next().is_none()));
        assert!(env.service.messages(env.conversation.id, "owner").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn edit_window_scenario() {
        let env = test_service();
        let m = env.service.send_message(send(&env, "owner", "draft")).await.unwrap();
        let edit = |text: &str| EditMessage {
            conversation_id: env.conversation.id,
            message_id: m.id,
            sender_id: "owner".into(),
            new_text: text.into(),
        };
        env.clock.advance(Duration::from_secs(4 * 60));
        let edited = env.service.edit_message(edit("final")).await.unwrap();
        assert_eq!(edited.body.text(), Some("final"));
        assert!(edited.edited_at.is_some());

        env.clock.advance(Duration::from_secs(2 * 60));
        assert_eq!(
            env.service.edit_message(edit("too late")).await.unwrap_err(),
            ChatError::EditWindowExpired { max_edit_minutes: 5 }
        );
    }

    #[tokio::test]
    async fn concurrent_reactions_are_independent() {
        let env = test_service();
        let m = env.service.send_message(send(&env, "owner", "ship it?")).await.unwrap();
        let (a, b) = tokio::join!(
            env.service
                .toggle_reaction(env.conversation.id, m.id, "owner", Emoji::ThumbsUp),
            env.service
                .toggle_reaction(env.conversation.id, m.id, "tester", Emoji::ThumbsUp),
        );
        assert!(a.unwrap() && b.unwrap());
        let all = env.service.messages(env.conversation.id, "owner").await.unwrap();
        let reactors: Vec<_> = all[0].reactions.reactors(Emoji::ThumbsUp).collect();
        assert_eq!(reactors, vec!["owner", "tester"]);
    }

    #[tokio::test]
    async fn outsiders_are_rejected_everywhere() {
        let env = test_service();
        let conv = env.conversation.id;
        let m = env.service.send_message(send(&env, "owner", "private")).await.unwrap();
        assert_eq!(
            env.service.open_conversation(conv, "carol").await.unwrap_err(),
            ChatError::NotParticipant
        );
        assert_eq!(
            env.service.messages(conv, "carol").await.unwrap_err(),
            ChatError::NotParticipant
        );
        assert!(env.service.subscribe_messages(conv, "carol").await.is_err());
        assert_eq!(
            env.service.send_message(send(&env, "carol", "hi")).await.unwrap_err(),
            ChatError::NotParticipant
        );
        assert!(env.service.toggle_pin(conv, m.id, "carol").await.is_err());
        assert_eq!(
            env.service.open_conversation(Uuid::new_v4(), "owner").await.unwrap_err(),
            ChatError::NotFound
        );
        assert!(env.service.list_conversations("carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_resolves_counterpart_per_viewer() {
        let env = test_service();
        let opened = env.service.open_conversation(env.conversation.id, "owner").await.unwrap();
        assert_eq!(opened.counterpart.display_name, "Theo Tester");
        let opened = env.service.open_conversation(env.conversation.id, "tester").await.unwrap();
        assert_eq!(opened.counterpart.display_name, "Olivia Owner");
    }

    #[tokio::test]
    async fn deletion_reaches_live_subscribers() {
        let env = test_service();
        let m = env.service.send_message(send(&env, "owner", "oops")).await.unwrap();
        let mut feed = env
            .service
            .subscribe_messages(env.conversation.id, "tester")
            .await
            .unwrap();
        assert!(matches!(feed.next().await, Some(FeedEvent::Snapshot(v)) if v.len() == 1));
        env.service
            .delete_message(env.conversation.id, m.id, "owner")
            .await
            .unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), feed.next()).await.unwrap();
        assert_eq!(next, Some(FeedEvent::Snapshot(vec![])));
    }

    #[tokio::test]
    async fn attachment_send_requires_conversation_scoped_reference() {
        let env = test_service();
        let att = env
            .service
            .upload_attachment(
                env.conversation.id,
                "tester",
                UploadFile {
                    file_name: "log.txt".into(),
                    data: Bytes::from_static(b"stack trace"),
                },
            )
            .await
            .unwrap();
        let mut foreign = att.clone();
        foreign.path = format!("conversations/{}/1_log.txt", Uuid::new_v4());
        let req = |attachment| SendMessage {
            conversation_id: env.conversation.id,
            sender_id: "tester".into(),
            attachment: Some(attachment),
            ..Default::default()
        };
        assert!(matches!(
            env.service.send_message(req(foreign)).await,
            Err(ChatError::Invalid(_))
        ));
        let sent = env.service.send_message(req(att.clone())).await.unwrap();
        assert_eq!(sent.body.attachment(), Some(&att));
        assert!(env.service.can_read_blob(&att.path, "owner").await.unwrap());
        assert!(!env.service.can_read_blob(&att.path, "carol").await.unwrap());
    }

    #[tokio::test]
    async fn forged_attachment_references_are_refused_or_rewritten() {
        let env = test_service();
        let conv = env.conversation.id;
        let real = env
            .service
            .upload_attachment(
                conv,
                "owner",
                UploadFile {
                    file_name: "screenshot.png".into(),
                    data: Bytes::from_static(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]),
                },
            )
            .await
            .unwrap();
        let send_ref = |attachment: AttachmentRef| SendMessage {
            conversation_id: conv,
            sender_id: "owner".into(),
            attachment: Some(attachment),
            ..Default::default()
        };

        let forged = AttachmentRef {
            url: "https://evil.example/login".into(),
            mime: "text/html".into(),
            size_bytes: 999_999_999_999,
            ..real.clone()
        };
        let sent = env.service.send_message(send_ref(forged)).await.unwrap();
        assert_eq!(sent.body.attachment(), Some(&real));

        let never_uploaded = AttachmentRef {
            path: format!("conversations/{conv}/0_never_uploaded.png"),
            ..real.clone()
        };
        assert_eq!(
            env.service.send_message(send_ref(never_uploaded)).await.unwrap_err(),
            ChatError::Invalid("attachment_missing".into())
        );
        // outsiders learn nothing about which blobs exist
        let outsider = SendMessage {
            sender_id: "carol".into(),
            ..send_ref(real.clone())
        };
        assert_eq!(
            env.service.send_message(outsider).await.unwrap_err(),
            ChatError::NotParticipant
        );
        let all = env.service.messages(conv, "owner").await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn sent_and_edited_text_are_normalized_alike() {
        let env = test_service();
        let m = env.service.send_message(send(&env, "owner", "  hi there \n")).await.unwrap();
        assert_eq!(m.body.text(), Some("hi there"));
        let edited = env
            .service
            .edit_message(EditMessage {
                conversation_id: env.conversation.id,
                message_id: m.id,
                sender_id: "owner".into(),
                new_text: "\n hello there  ".into(),
            })
            .await
            .unwrap();
        assert_eq!(edited.body.text(), Some("hello there"));
        let stored = env.service.messages(env.conversation.id, "tester").await.unwrap();
        assert_eq!(stored[0].body.text(), Some("hello there"));
    }

    #[tokio::test]
    async fn reply_preview_matches_what_is_sent() {
        let env = test_service();
        let hi = env.service.send_message(send(&env, "owner", "Hi")).await.unwrap();
        let preview = env
            .service
            .reply_preview(env.conversation.id, hi.id, "owner")
            .await
            .unwrap();
        let reply = env
            .service
            .send_message(SendMessage {
                reply_to: Some(hi.id),
                ..send(&env, "owner", "adding context")
            })
            .await
            .unwrap();
        assert_eq!(reply.reply_to, Some(preview));
        assert_eq!(
            env.service
                .reply_preview(env.conversation.id, hi.id, "carol")
                .await
                .unwrap_err(),
            ChatError::NotParticipant
        );
    }

    #[tokio::test]
    async fn directory_lists_for_both_participants() {
        let env = test_service();
        env.service.send_message(send(&env, "tester", "found a bug")).await.unwrap();
        for viewer in ["owner", "tester"] {
            let list = env.service.list_conversations(viewer).await.unwrap();
            assert_eq!(list.len(), 1);
            assert_eq!(list[0].last_message.as_deref(), Some("found a bug"));
        }
    }
}
