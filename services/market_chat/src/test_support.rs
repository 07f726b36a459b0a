use crate::attachments::FsBlobStore;
use crate::clock::ManualClock;
use crate::conversations::{insert_conversation, upsert_profile};
use crate::db;
use crate::model::{Conversation, Counterpart, MessageBody};
use crate::service::ChatService;
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

pub const EDIT_WINDOW_MS: i64 = 5 * 60_000;

pub fn conversation(owner: &str, tester: &str) -> Conversation {
    Conversation {
        id: Uuid::new_v4(),
        project_id: "proj-1".into(),
        project_title: "Checkout flow QA".into(),
        owner_id: owner.into(),
        tester_id: tester.into(),
    }
}

pub fn profile(user_id: &str, name: &str) -> Counterpart {
    Counterpart {
        user_id: user_id.into(),
        display_name: name.into(),
        avatar_url: None,
    }
}

/// In-memory database holding one owner/tester conversation.
pub fn seeded_conn() -> (Connection, Conversation) {
    let conn = db::init_db(":memory:", EDIT_WINDOW_MS).unwrap();
    let conv = conversation("owner", "tester");
    insert_conversation(&conn, &conv).unwrap();
    upsert_profile(&conn, &profile("owner", "Olivia Owner")).unwrap();
    upsert_profile(&conn, &profile("tester", "Theo Tester")).unwrap();
    (conn, conv)
}

pub fn text(s: &str) -> MessageBody {
    MessageBody::Text { text: s.into() }
}

/// A service over a temp-file database with the seeded owner/tester conversation.
pub struct TestEnv {
    pub service: ChatService,
    pub clock: ManualClock,
    pub conversation: Conversation,
    pub dir: tempfile::TempDir,
}

impl TestEnv {
    pub fn blob_root(&self) -> PathBuf {
        self.dir.path().join("blobs")
    }
}

pub fn test_service() -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let pool = db::open_pool(dir.path().join("chat.db"), EDIT_WINDOW_MS).unwrap();
    let conversation = conversation("owner", "tester");
    {
        let conn = pool.get().unwrap();
        insert_conversation(&conn, &conversation).unwrap();
        upsert_profile(&conn, &profile("owner", "Olivia Owner")).unwrap();
        upsert_profile(&conn, &profile("tester", "Theo Tester")).unwrap();
    }
    let clock = ManualClock::new(1_700_000_000_000);
    let blobs = FsBlobStore::new(
        dir.path().join("blobs"),
        Url::parse("http://127.0.0.1:8788/").unwrap(),
    );
    let service = ChatService::new(
        pool,
        Arc::new(clock.clone()),
        Arc::new(blobs),
        10 * 1024 * 1024,
        EDIT_WINDOW_MS,
    );
    TestEnv {
        service,
        clock,
        conversation,
        dir,
    }
}
