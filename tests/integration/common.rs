use async_trait::async_trait;
use discord_relay::config::{AppConfig, LoadedConfig, parse_config};
use discord_relay::db::Db;
use discord_relay::discord::{ChatSender, SendError, SentMessage};
use discord_relay::models::{ChatMessageRecord, Destination};
use discord_relay::queue::{QueueService, webhook_debounce_map};
use rocket::local::blocking::Client;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Base config used by most API tests: one chat bot, two backends, a default
/// route to `backend_alpha`.
pub const BASE_CONFIG: &str = r#"
server: {}
storage: {}
discord_bots:
  - id: discord_a
    name: Bot A
    token: TEST
backend_bots:
  - id: backend_alpha
    name: Backend Alpha
    api_key: alpha-key
  - id: backend_beta
    name: Backend Beta
    api_key: beta-key
routing:
  defaults:
    discord_a: backend_alpha
"#;

fn temp_db_path(prefix: &str) -> String {
    format!(
        "/tmp/{prefix}_{}.db",
        uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
    )
}

fn remove_db_files(path: &str) {
    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(format!("{path}-wal"));
    let _ = std::fs::remove_file(format!("{path}-shm"));
}

#[derive(Debug, Clone)]
pub struct SendCall {
    pub chat_bot_id: String,
    pub destination: Destination,
    pub content: String,
    pub reply_to: Option<String>,
}

/// ChatSender double that records calls and fabricates a message ID.
#[derive(Default)]
pub struct RecordingChatSender {
    pub calls: Mutex<Vec<SendCall>>,
}

#[async_trait]
impl ChatSender for RecordingChatSender {
    async fn send_text(
        &self,
        chat_bot_id: &str,
        destination: &Destination,
        content: &str,
        reply_to_chat_message_id: Option<&str>,
    ) -> Result<SentMessage, SendError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SendCall {
                chat_bot_id: chat_bot_id.to_string(),
                destination: destination.clone(),
                content: content.to_string(),
                reply_to: reply_to_chat_message_id.map(String::from),
            });
        Ok(SentMessage {
            chat_message_id: "999".to_string(),
            channel_id: destination.channel_id.clone(),
        })
    }
}

/// Wrapper around a Rocket test client that deletes the temp DB on drop.
/// Client is dropped first to release the SQLite connection (WAL mode holds
/// the file).
pub struct TestRelay {
    client: Option<Client>,
    pub db_path: String,
    pub config: AppConfig,
    pub sender: Arc<RecordingChatSender>,
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        drop(self.client.take());
        remove_db_files(&self.db_path);
    }
}

impl std::ops::Deref for TestRelay {
    type Target = Client;
    fn deref(&self) -> &Client {
        self.client.as_ref().unwrap()
    }
}

impl TestRelay {
    /// A second QueueService over the same DB file, for driving the ingest
    /// side directly (there is no HTTP ingest endpoint).
    pub fn queue(&self) -> QueueService {
        let db = Arc::new(Db::open(&self.db_path).expect("open test db"));
        QueueService::new(db, webhook_debounce_map(&self.config))
    }

    /// Raw connection for asserting on persisted state.
    pub fn raw_conn(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(&self.db_path).expect("open test db")
    }
}

pub fn test_relay() -> TestRelay {
    test_relay_with(BASE_CONFIG)
}

pub fn test_relay_with(yaml: &str) -> TestRelay {
    let db_path = temp_db_path("relay_test");
    let mut config = parse_config(yaml).expect("valid test config");
    config.storage.database_url = format!("sqlite:///{db_path}");

    let sender = Arc::new(RecordingChatSender::default());
    let loaded = LoadedConfig {
        path: PathBuf::from("config/test-relay.yaml"),
        data: config.clone(),
    };
    let chat_sender: Arc<dyn ChatSender> = sender.clone();
    let rocket = discord_relay::build_rocket(loaded, chat_sender).expect("valid relay config");
    let client = Client::tracked(rocket).expect("valid rocket instance");

    TestRelay {
        client: Some(client),
        db_path,
        config,
        sender,
    }
}

/// Standalone queue over a throwaway DB, for tests that bypass HTTP.
pub struct TestQueue {
    pub db_path: String,
    pub db: Arc<Db>,
}

impl Drop for TestQueue {
    fn drop(&mut self) {
        remove_db_files(&self.db_path);
    }
}

impl TestQueue {
    pub fn new() -> Self {
        let db_path = temp_db_path("relay_queue_test");
        let db = Arc::new(Db::open(&db_path).expect("open test db"));
        TestQueue { db_path, db }
    }

    pub fn service(&self) -> QueueService {
        self.service_with_debounce(HashMap::new())
    }

    pub fn service_with_debounce(&self, debounce: HashMap<String, f64>) -> QueueService {
        QueueService::new(self.db.clone(), debounce)
    }

    pub fn raw_conn(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(&self.db_path).expect("open test db")
    }
}

/// A DM message record with the default dedupe-key inputs filled in.
pub fn dm_record(chat_bot_id: &str, chat_message_id: &str, content: &str) -> ChatMessageRecord {
    ChatMessageRecord {
        chat_message_id: chat_message_id.to_string(),
        chat_bot_id: chat_bot_id.to_string(),
        author_id: "user1".to_string(),
        author_name: "User One".to_string(),
        channel_id: None,
        guild_id: None,
        is_dm: true,
        content: content.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

/// A channel message record with an explicit timestamp, for history tests.
pub fn channel_record(
    chat_bot_id: &str,
    chat_message_id: &str,
    channel_id: &str,
    content: &str,
    timestamp: &str,
) -> ChatMessageRecord {
    ChatMessageRecord {
        chat_message_id: chat_message_id.to_string(),
        chat_bot_id: chat_bot_id.to_string(),
        author_id: "user1".to_string(),
        author_name: "User One".to_string(),
        channel_id: Some(channel_id.to_string()),
        guild_id: Some("guild1".to_string()),
        is_dm: false,
        content: content.to_string(),
        timestamp: timestamp.to_string(),
    }
}
