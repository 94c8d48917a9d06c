use crate::config::WebhookConfig;
use crate::db::Db;
use crate::models::NudgeState;
use hmac::{Hmac, Mac};
use rusqlite::params;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_POLL_INTERVAL_SECONDS: f64 = 1.0;
pub const CLAIM_BATCH_SIZE: usize = 25;

/// `hex(HMAC-SHA256(secret, timestamp || "." || body))`, lowercase.
pub fn compute_webhook_signature(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Snapshot of a nudge's pre-claim fields, taken while transitioning it to
/// SENDING.
#[derive(Debug, Clone)]
pub struct ClaimedNudge {
    pub id: String,
    pub backend_bot_id: String,
    pub chat_bot_id: Option<String>,
    pub last_dedupe_key: Option<String>,
    pub attempts: i64,
}

/// Background worker that delivers pending webhook nudges. Owns its own DB
/// connection; one cooperative worker per process.
pub struct WebhookDispatcher {
    db: Db,
    backend_webhooks: HashMap<String, WebhookConfig>,
    client: reqwest::Client,
}

/// Spawns the dispatcher poll loop on its own DB connection.
pub fn spawn_dispatcher(
    db_path: String,
    backend_webhooks: HashMap<String, WebhookConfig>,
    poll_interval_seconds: f64,
) {
    tokio::spawn(async move {
        let db = match Db::open(&db_path) {
            Ok(db) => db,
            Err(e) => {
                eprintln!("⚠️ Webhook dispatcher: failed to open DB: {e}");
                return;
            }
        };
        let dispatcher = WebhookDispatcher::new(db, backend_webhooks);
        loop {
            dispatcher.process_once(CLAIM_BATCH_SIZE).await;
            tokio::time::sleep(Duration::from_secs_f64(poll_interval_seconds)).await;
        }
    });
}

impl WebhookDispatcher {
    pub fn new(db: Db, backend_webhooks: HashMap<String, WebhookConfig>) -> Self {
        WebhookDispatcher {
            db,
            backend_webhooks,
            // Per-request timeouts come from each backend's webhook config.
            client: reqwest::Client::new(),
        }
    }

    /// Claim and deliver due nudges once; returns the number attempted.
    pub async fn process_once(&self, limit: usize) -> usize {
        let claimed = match self.claim_due_nudges(limit) {
            Ok(claimed) => claimed,
            Err(e) => {
                eprintln!("⚠️ Webhook dispatcher: failed to claim nudges: {e}");
                return 0;
            }
        };
        let attempted = claimed.len();
        for nudge in claimed {
            self.deliver_one(nudge).await;
        }
        attempted
    }

    /// PENDING nudges due now move to SENDING inside one transaction,
    /// preventing duplicate delivery across worker passes.
    fn claim_due_nudges(&self, limit: usize) -> rusqlite::Result<Vec<ClaimedNudge>> {
        let now = chrono::Utc::now().to_rfc3339();
        self.db.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, backend_bot_id, chat_bot_id, last_dedupe_key, attempts \
                 FROM webhook_nudges WHERE state = ?1 AND next_attempt_at <= ?2 \
                 ORDER BY next_attempt_at LIMIT ?3",
            )?;
            let claimed: Vec<ClaimedNudge> = stmt
                .query_map(
                    params![NudgeState::Pending.as_str(), &now, limit as i64],
                    |row| {
                        Ok(ClaimedNudge {
                            id: row.get(0)?,
                            backend_bot_id: row.get(1)?,
                            chat_bot_id: row.get(2)?,
                            last_dedupe_key: row.get(3)?,
                            attempts: row.get(4)?,
                        })
                    },
                )?
                .collect::<rusqlite::Result<_>>()?;
            drop(stmt);
            for nudge in &claimed {
                tx.execute(
                    "UPDATE webhook_nudges SET state = ?1, updated_at = ?2 WHERE id = ?3",
                    params![NudgeState::Sending.as_str(), &now, &nudge.id],
                )?;
            }
            Ok(claimed)
        })
    }

    async fn deliver_one(&self, nudge: ClaimedNudge) {
        // Backend removed from config while a nudge was queued.
        let Some(webhook) = self.backend_webhooks.get(&nudge.backend_bot_id) else {
            self.delete_nudge(&nudge.id);
            return;
        };

        let payload = serde_json::json!({
            "event": "messages_available",
            "backend_bot_id": nudge.backend_bot_id,
            "chat_bot_id": nudge.chat_bot_id,
            "sent_at": chrono::Utc::now().to_rfc3339(),
            "dedupe_key": nudge.last_dedupe_key,
        });
        let body = payload.to_string();
        let timestamp = chrono::Utc::now().timestamp().to_string();

        let secret = match webhook.resolved_secret() {
            Ok(secret) => secret,
            Err(_) => {
                self.mark_failed(&nudge.id, "secret_error:ConfigError");
                return;
            }
        };
        let signature = compute_webhook_signature(&secret, &timestamp, body.as_bytes());

        let response = self
            .client
            .post(&webhook.url)
            .header("Content-Type", "application/json")
            .header("X-Relay-Timestamp", &timestamp)
            .header("X-Relay-Signature", &signature)
            .timeout(Duration::from_secs_f64(webhook.request_timeout_seconds))
            .body(body)
            .send()
            .await;

        match response {
            Err(e) => {
                let error = format!("request_error:{}", request_error_class(&e));
                self.schedule_retry(&nudge, webhook, &error);
            }
            Ok(resp) if resp.status().is_success() => self.delete_nudge(&nudge.id),
            Ok(resp) => {
                let code = resp.status().as_u16();
                let error = format!("http_status:{code}");
                if code == 429 || code >= 500 {
                    self.schedule_retry(&nudge, webhook, &error);
                } else {
                    self.mark_failed(&nudge.id, &error);
                }
            }
        }
    }

    fn schedule_retry(&self, nudge: &ClaimedNudge, webhook: &WebhookConfig, error: &str) {
        let attempts = nudge.attempts + 1;
        if attempts > webhook.max_retries {
            self.mark_failed(&nudge.id, error);
            return;
        }
        let backoff_idx =
            (attempts - 1).clamp(0, webhook.retry_backoff_seconds.len() as i64 - 1) as usize;
        let retry_in = webhook.retry_backoff_seconds[backoff_idx];
        let next_attempt_at = (chrono::Utc::now()
            + chrono::Duration::milliseconds((retry_in * 1000.0).round() as i64))
        .to_rfc3339();
        self.reschedule_nudge(&nudge.id, attempts, &next_attempt_at, error);
    }

    fn delete_nudge(&self, nudge_id: &str) {
        if let Err(e) = self.db.conn().execute(
            "DELETE FROM webhook_nudges WHERE id = ?1",
            params![nudge_id],
        ) {
            eprintln!("⚠️ Webhook dispatcher: failed to delete nudge {nudge_id}: {e}");
        }
    }

    fn mark_failed(&self, nudge_id: &str, error: &str) {
        let now = chrono::Utc::now().to_rfc3339();
        if let Err(e) = self.db.conn().execute(
            "UPDATE webhook_nudges SET state = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
            params![NudgeState::Failed.as_str(), error, &now, nudge_id],
        ) {
            eprintln!("⚠️ Webhook dispatcher: failed to mark nudge {nudge_id} failed: {e}");
        }
    }

    fn reschedule_nudge(&self, nudge_id: &str, attempts: i64, next_attempt_at: &str, error: &str) {
        let now = chrono::Utc::now().to_rfc3339();
        if let Err(e) = self.db.conn().execute(
            "UPDATE webhook_nudges SET state = ?1, attempts = ?2, next_attempt_at = ?3, \
             last_error = ?4, updated_at = ?5 WHERE id = ?6",
            params![
                NudgeState::Pending.as_str(),
                attempts,
                next_attempt_at,
                error,
                &now,
                nudge_id,
            ],
        ) {
            eprintln!("⚠️ Webhook dispatcher: failed to reschedule nudge {nudge_id}: {e}");
        }
    }
}

fn request_error_class(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        "timeout"
    } else if error.is_connect() {
        "connect"
    } else {
        "request"
    }
}
