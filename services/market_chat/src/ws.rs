use crate::error::{ChatError, ChatResult};
use crate::model::{ClientAction, ServerEvent};
use crate::session::{ConversationSession, SessionUpdate};
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

fn notice(e: &ChatError) -> ServerEvent {
    ServerEvent::Notice {
        code: e.code().into(),
        retryable: e.is_retryable(),
    }
}

fn composer(session: &ConversationSession) -> ServerEvent {
    ServerEvent::Composer {
        composer: session.composer().clone(),
    }
}

fn snapshot(session: &ConversationSession) -> Option<ServerEvent> {
    let conversation_id = session.conversation()?.id;
    Some(ServerEvent::Snapshot {
        conversation_id,
        messages: session.render(),
        pinned: session.pinned(),
    })
}

async fn apply(session: &mut ConversationSession, action: ClientAction) -> ChatResult<Vec<ServerEvent>> {
    let events = match action {
        ClientAction::Open { conversation_id } => {
            let opened = session.open(conversation_id).await?;
            vec![
                ServerEvent::Opened {
                    conversation: opened.conversation,
                    counterpart: opened.counterpart,
                },
                composer(session),
            ]
        }
        ClientAction::Close => {
            session.close();
            vec![ServerEvent::Closed, composer(session)]
        }
        ClientAction::Draft { text } => {
            session.set_draft(text);
            vec![composer(session)]
        }
        ClientAction::Stage { attachment } => {
            session.stage(attachment)?;
            vec![composer(session)]
        }
        ClientAction::Unstage => {
            session.unstage();
            vec![composer(session)]
        }
        ClientAction::Reply { message_id } => {
            session.start_reply(message_id).await?;
            vec![composer(session)]
        }
        ClientAction::Edit { message_id } => {
            session.start_edit(message_id)?;
            vec![composer(session)]
        }
        ClientAction::Cancel => {
            session.cancel();
            vec![composer(session)]
        }
        ClientAction::Submit => {
            session.submit().await?;
            vec![composer(session)]
        }
        ClientAction::React { message_id, emoji } => {
            session.react(message_id, emoji).await?;
            vec![]
        }
        ClientAction::Pin { message_id } => {
            session.pin(message_id).await?;
            vec![]
        }
        ClientAction::Delete { message_id } => {
            session.delete(message_id).await?;
            vec![composer(session)]
        }
    };
    Ok(events)
}

async fn handle_text(session: &mut ConversationSession, text: &str) -> Vec<ServerEvent> {
    let action = match serde_json::from_str::<ClientAction>(text) {
        Ok(action) => action,
        Err(e) => {
            debug!(error = %e, "unparseable client action");
            return vec![ServerEvent::Notice {
                code: "invalid_action".into(),
                retryable: false,
            }];
        }
    };
    match apply(session, action).await {
        Ok(events) => events,
        Err(e) => vec![notice(&e)],
    }
}

async fn send_event(sink: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to encode server event");
            true
        }
    }
}

/// Drive one client: actions in, rendered state out. The socket survives any
/// failure of an individual action; closing it releases the open conversation.
pub async fn handle_socket(stream: WebSocket, mut session: ConversationSession) {
    let (mut sender, mut receiver) = stream.split();
    let hello = ServerEvent::Hello {
        user_id: session.user_id().to_string(),
    };
    if !send_event(&mut sender, &hello).await {
        return;
    }
    'socket: loop {
        let events: Vec<ServerEvent> = tokio::select! {
            update = session.next_update(), if session.is_open() => match update {
                Some(SessionUpdate::Messages) => snapshot(&session).into_iter().collect(),
                Some(SessionUpdate::Failed(e)) => {
                    warn!(user = %session.user_id(), error = %e, "live feed failed");
                    vec![notice(&e), ServerEvent::Closed]
                }
                None => vec![],
            },
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(&mut session, &text).await,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        };
        for event in &events {
            if !send_event(&mut sender, event).await {
                break 'socket;
            }
        }
    }
    session.close();
    debug!(user = %session.user_id(), "socket closed");
}
