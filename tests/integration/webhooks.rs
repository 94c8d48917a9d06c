use crate::common::{TestQueue, dm_record};
use discord_relay::config::WebhookConfig;
use discord_relay::db::Db;
use discord_relay::webhooks::{WebhookDispatcher, compute_webhook_signature};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;

fn webhook_config(url: String) -> WebhookConfig {
    WebhookConfig {
        url,
        secret: Some("test-secret".to_string()),
        secret_env: None,
        send_debounce_seconds: 0.0,
        request_timeout_seconds: 5.0,
        max_retries: 2,
        retry_backoff_seconds: vec![30.0, 60.0],
    }
}

fn insert_nudge(
    conn: &rusqlite::Connection,
    backend_bot_id: &str,
    state: &str,
    attempts: i64,
    next_attempt_at: &str,
) -> String {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO webhook_nudges (id, backend_bot_id, chat_bot_id, last_dedupe_key, state, \
         attempts, next_attempt_at, created_at, updated_at) \
         VALUES (?1, ?2, 'discord_a', 'discord_a:55', ?3, ?4, ?5, ?6, ?6)",
        rusqlite::params![&id, backend_bot_id, state, attempts, next_attempt_at, &now],
    )
    .unwrap();
    id
}

fn due_now() -> String {
    (chrono::Utc::now() - chrono::Duration::seconds(1)).to_rfc3339()
}

fn dispatcher_for(
    harness: &TestQueue,
    webhooks: HashMap<String, WebhookConfig>,
) -> WebhookDispatcher {
    WebhookDispatcher::new(Db::open(&harness.db_path).unwrap(), webhooks)
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Runtime::new().unwrap().block_on(future)
}

// --- Signature (invariant: hex(HMAC-SHA256(secret, timestamp || "." || body))) ---

#[test]
fn test_signature_covers_timestamp_dot_body() {
    let signature = compute_webhook_signature("test-secret", "1700000000", b"{\"event\":\"x\"}");

    let mut mac = Hmac::<Sha256>::new_from_slice(b"test-secret").unwrap();
    mac.update(b"1700000000.{\"event\":\"x\"}");
    let expected = hex::encode(mac.finalize().into_bytes());

    assert_eq!(signature, expected);
    assert_eq!(signature.len(), 64);
    assert!(signature.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[test]
fn test_signature_varies_with_inputs() {
    let base = compute_webhook_signature("secret", "100", b"body");
    assert_ne!(base, compute_webhook_signature("other", "100", b"body"));
    assert_ne!(base, compute_webhook_signature("secret", "101", b"body"));
    assert_ne!(base, compute_webhook_signature("secret", "100", b"tail"));
    // Deterministic for identical inputs.
    assert_eq!(base, compute_webhook_signature("secret", "100", b"body"));
}

// --- Debounced scheduling (S7) ---

#[test]
fn test_enqueue_schedules_debounced_nudge_and_coalesces() {
    let harness = TestQueue::new();
    let queue =
        harness.service_with_debounce(HashMap::from([("backend_alpha".to_string(), 2.0)]));

    queue
        .enqueue_message("backend_alpha", &dm_record("discord_a", "55", "hello"), "discord_a:55")
        .unwrap();

    let conn = harness.raw_conn();
    let (state, key, next1): (String, String, String) = conn
        .query_row(
            "SELECT state, last_dedupe_key, next_attempt_at FROM webhook_nudges",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .unwrap();
    assert_eq!(state, "pending");
    assert_eq!(key, "discord_a:55");

    queue
        .enqueue_message("backend_alpha", &dm_record("discord_a", "56", "again"), "discord_a:56")
        .unwrap();

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM webhook_nudges", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 1, "at most one nudge per backend");

    let (key, next2): (String, String) = conn
        .query_row(
            "SELECT last_dedupe_key, next_attempt_at FROM webhook_nudges",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(key, "discord_a:56");
    assert!(next2 >= next1, "sliding debounce must not move backwards");
}

#[test]
fn test_no_nudge_without_configured_debounce() {
    let harness = TestQueue::new();
    let queue = harness.service();

    queue
        .enqueue_message("backend_alpha", &dm_record("discord_a", "55", "hello"), "discord_a:55")
        .unwrap();

    let count: i64 = harness
        .raw_conn()
        .query_row("SELECT COUNT(*) FROM webhook_nudges", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn test_failed_nudge_is_revived_by_new_ingress() {
    let harness = TestQueue::new();
    let queue =
        harness.service_with_debounce(HashMap::from([("backend_alpha".to_string(), 0.0)]));

    let conn = harness.raw_conn();
    insert_nudge(&conn, "backend_alpha", "failed", 3, &due_now());
    conn.execute(
        "UPDATE webhook_nudges SET last_error = 'http_status:410'",
        [],
    )
    .unwrap();

    queue
        .enqueue_message("backend_alpha", &dm_record("discord_a", "57", "revive"), "discord_a:57")
        .unwrap();

    let (state, attempts, last_error): (String, i64, Option<String>) = conn
        .query_row(
            "SELECT state, attempts, last_error FROM webhook_nudges",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .unwrap();
    assert_eq!(state, "pending");
    assert_eq!(attempts, 0);
    assert!(last_error.is_none());
}

#[test]
fn test_sending_nudge_is_reclaimed_without_resetting_attempts() {
    let harness = TestQueue::new();
    let queue =
        harness.service_with_debounce(HashMap::from([("backend_alpha".to_string(), 0.0)]));

    let conn = harness.raw_conn();
    insert_nudge(&conn, "backend_alpha", "sending", 2, &due_now());

    queue
        .enqueue_message("backend_alpha", &dm_record("discord_a", "58", "reclaim"), "discord_a:58")
        .unwrap();

    let (state, attempts): (String, i64) = conn
        .query_row("SELECT state, attempts FROM webhook_nudges", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .unwrap();
    assert_eq!(state, "pending");
    assert_eq!(attempts, 2);
}

// --- Dispatcher delivery (S6) ---

#[test]
fn test_dispatcher_sends_signed_post_and_clears_outbox() {
    let harness = TestQueue::new();
    insert_nudge(&harness.raw_conn(), "backend_alpha", "pending", 0, &due_now());

    let mut server = mockito::Server::new();
    let mock = server
        .mock("POST", "/nudge")
        .match_header("content-type", "application/json")
        .match_header(
            "x-relay-timestamp",
            mockito::Matcher::Regex(r"^\d+$".to_string()),
        )
        .match_header(
            "x-relay-signature",
            mockito::Matcher::Regex(r"^[0-9a-f]{64}$".to_string()),
        )
        .with_status(200)
        .with_body("ok")
        .create();

    let dispatcher = dispatcher_for(
        &harness,
        HashMap::from([(
            "backend_alpha".to_string(),
            webhook_config(format!("{}/nudge", server.url())),
        )]),
    );
    let attempted = block_on(dispatcher.process_once(25));
    assert_eq!(attempted, 1);
    mock.assert();

    let count: i64 = harness
        .raw_conn()
        .query_row("SELECT COUNT(*) FROM webhook_nudges", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 0, "delivered nudge must be deleted");
}

#[test]
fn test_dispatcher_skips_nudges_that_are_not_due() {
    let harness = TestQueue::new();
    let future = (chrono::Utc::now() + chrono::Duration::seconds(60)).to_rfc3339();
    insert_nudge(&harness.raw_conn(), "backend_alpha", "pending", 0, &future);

    let dispatcher = dispatcher_for(&harness, HashMap::new());
    assert_eq!(block_on(dispatcher.process_once(25)), 0);
}

#[test]
fn test_dispatcher_retries_on_server_error() {
    let harness = TestQueue::new();
    insert_nudge(&harness.raw_conn(), "backend_alpha", "pending", 0, &due_now());

    let mut server = mockito::Server::new();
    server.mock("POST", "/nudge").with_status(500).create();

    let before = chrono::Utc::now().to_rfc3339();
    let dispatcher = dispatcher_for(
        &harness,
        HashMap::from([(
            "backend_alpha".to_string(),
            webhook_config(format!("{}/nudge", server.url())),
        )]),
    );
    assert_eq!(block_on(dispatcher.process_once(25)), 1);

    let (state, attempts, next_attempt_at, last_error): (String, i64, String, String) = harness
        .raw_conn()
        .query_row(
            "SELECT state, attempts, next_attempt_at, last_error FROM webhook_nudges",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .unwrap();
    assert_eq!(state, "pending");
    assert_eq!(attempts, 1);
    assert_eq!(last_error, "http_status:500");
    assert!(next_attempt_at > before, "backoff must push the next attempt out");
}

#[test]
fn test_dispatcher_treats_429_as_retryable() {
    let harness = TestQueue::new();
    insert_nudge(&harness.raw_conn(), "backend_alpha", "pending", 0, &due_now());

    let mut server = mockito::Server::new();
    server.mock("POST", "/nudge").with_status(429).create();

    let dispatcher = dispatcher_for(
        &harness,
        HashMap::from([(
            "backend_alpha".to_string(),
            webhook_config(format!("{}/nudge", server.url())),
        )]),
    );
    block_on(dispatcher.process_once(25));

    let state: String = harness
        .raw_conn()
        .query_row("SELECT state FROM webhook_nudges", [], |r| r.get(0))
        .unwrap();
    assert_eq!(state, "pending");
}

#[test]
fn test_dispatcher_marks_client_errors_failed() {
    let harness = TestQueue::new();
    insert_nudge(&harness.raw_conn(), "backend_alpha", "pending", 0, &due_now());

    let mut server = mockito::Server::new();
    server.mock("POST", "/nudge").with_status(410).create();

    let dispatcher = dispatcher_for(
        &harness,
        HashMap::from([(
            "backend_alpha".to_string(),
            webhook_config(format!("{}/nudge", server.url())),
        )]),
    );
    block_on(dispatcher.process_once(25));

    let (state, last_error): (String, String) = harness
        .raw_conn()
        .query_row("SELECT state, last_error FROM webhook_nudges", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .unwrap();
    assert_eq!(state, "failed");
    assert_eq!(last_error, "http_status:410");
}

#[test]
fn test_dispatcher_fails_after_retries_exhaust() {
    let harness = TestQueue::new();
    // attempts already at the limit: the next retryable error exceeds it.
    insert_nudge(&harness.raw_conn(), "backend_alpha", "pending", 2, &due_now());

    let mut server = mockito::Server::new();
    server.mock("POST", "/nudge").with_status(503).create();

    let dispatcher = dispatcher_for(
        &harness,
        HashMap::from([(
            "backend_alpha".to_string(),
            webhook_config(format!("{}/nudge", server.url())),
        )]),
    );
    block_on(dispatcher.process_once(25));

    let (state, last_error): (String, String) = harness
        .raw_conn()
        .query_row("SELECT state, last_error FROM webhook_nudges", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .unwrap();
    assert_eq!(state, "failed");
    assert_eq!(last_error, "http_status:503");
}

#[test]
fn test_dispatcher_deletes_nudges_for_removed_backends() {
    let harness = TestQueue::new();
    insert_nudge(&harness.raw_conn(), "backend_gone", "pending", 0, &due_now());

    let dispatcher = dispatcher_for(&harness, HashMap::new());
    assert_eq!(block_on(dispatcher.process_once(25)), 1);

    let count: i64 = harness
        .raw_conn()
        .query_row("SELECT COUNT(*) FROM webhook_nudges", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn test_dispatcher_marks_unresolvable_secret_failed() {
    let harness = TestQueue::new();
    insert_nudge(&harness.raw_conn(), "backend_alpha", "pending", 0, &due_now());

    let mut config = webhook_config("http://127.0.0.1:9/never".to_string());
    config.secret = None;
    config.secret_env = Some("RELAY_TEST_NO_SUCH_SECRET_VAR".to_string());

    let dispatcher = dispatcher_for(
        &harness,
        HashMap::from([("backend_alpha".to_string(), config)]),
    );
    block_on(dispatcher.process_once(25));

    let (state, last_error): (String, String) = harness
        .raw_conn()
        .query_row("SELECT state, last_error FROM webhook_nudges", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .unwrap();
    assert_eq!(state, "failed");
    assert_eq!(last_error, "secret_error:ConfigError");
}

#[test]
fn test_transport_error_is_retryable() {
    let harness = TestQueue::new();
    insert_nudge(&harness.raw_conn(), "backend_alpha", "pending", 0, &due_now());

    // Nothing listens on this port; the connect fails fast.
    let dispatcher = dispatcher_for(
        &harness,
        HashMap::from([(
            "backend_alpha".to_string(),
            webhook_config("http://127.0.0.1:1/nudge".to_string()),
        )]),
    );
    block_on(dispatcher.process_once(25));

    let (state, attempts, last_error): (String, i64, String) = harness
        .raw_conn()
        .query_row(
            "SELECT state, attempts, last_error FROM webhook_nudges",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .unwrap();
    assert_eq!(state, "pending");
    assert_eq!(attempts, 1);
    assert!(last_error.starts_with("request_error:"), "got {last_error}");
}
