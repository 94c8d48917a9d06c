use crate::config::AppConfig;
use crate::db::Db;
use crate::models::{
    ChatMessageRecord, DeliveryRecord, DeliveryState, LeasedDeliveryRecord, NudgeState,
};
use rusqlite::{Row, Transaction, params};
use std::collections::HashMap;
use std::sync::Arc;

const MESSAGE_COLUMNS: &str = "m.chat_message_id, m.chat_bot_id, m.author_id, m.author_name, \
     m.channel_id, m.guild_id, m.is_dm, m.content, m.timestamp";

/// The queue engine: enqueue with dedup, FIFO leasing, ack/nack, expired
/// lease reaping, and conversation-history lookup. All state lives in the
/// shared `Db`; every operation is one short transaction.
pub struct QueueService {
    db: Arc<Db>,
    webhook_debounce_seconds: HashMap<String, f64>,
}

/// backend_bot_id -> send_debounce_seconds, for backends with a webhook.
pub fn webhook_debounce_map(config: &AppConfig) -> HashMap<String, f64> {
    config
        .backend_bots
        .iter()
        .filter(|bot| bot.enabled)
        .filter_map(|bot| {
            bot.webhook
                .as_ref()
                .map(|w| (bot.id.clone(), w.send_debounce_seconds))
        })
        .collect()
}

impl QueueService {
    pub fn new(db: Arc<Db>, webhook_debounce_seconds: HashMap<String, f64>) -> Self {
        QueueService {
            db,
            webhook_debounce_seconds,
        }
    }

    /// Persist a message and its delivery. Returns false when the dedupe key
    /// (or the (chat_bot_id, chat_message_id) pair) has already been seen.
    /// A successful insert also schedules a webhook nudge for backends with
    /// a configured debounce; nudge failures are logged, never propagated.
    pub fn enqueue_message(
        &self,
        backend_bot_id: &str,
        payload: &ChatMessageRecord,
        dedupe_key: &str,
    ) -> rusqlite::Result<bool> {
        let inserted = self.insert_message_and_delivery(backend_bot_id, payload, dedupe_key)?;
        if inserted
            && let Some(debounce) = self.webhook_debounce_seconds.get(backend_bot_id)
            && let Err(e) = self.schedule_webhook_nudge(
                backend_bot_id,
                &payload.chat_bot_id,
                dedupe_key,
                *debounce,
            )
        {
            eprintln!("⚠️ Failed to schedule webhook nudge for backend {backend_bot_id}: {e}");
        }
        Ok(inserted)
    }

    fn insert_message_and_delivery(
        &self,
        backend_bot_id: &str,
        payload: &ChatMessageRecord,
        dedupe_key: &str,
    ) -> rusqlite::Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        self.db.with_tx(|tx| {
            let message_id = uuid::Uuid::new_v4().to_string();
            let insert = tx.execute(
                "INSERT INTO messages (id, chat_bot_id, chat_message_id, author_id, author_name, \
                 channel_id, guild_id, is_dm, content, timestamp, dedupe_key, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    &message_id,
                    &payload.chat_bot_id,
                    &payload.chat_message_id,
                    &payload.author_id,
                    &payload.author_name,
                    &payload.channel_id,
                    &payload.guild_id,
                    payload.is_dm,
                    &payload.content,
                    &payload.timestamp,
                    dedupe_key,
                    &now,
                ],
            );
            match insert {
                Ok(_) => {}
                // Duplicate message (dedupe key). Ignore.
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
            tx.execute(
                "INSERT INTO deliveries (id, message_id, backend_bot_id, state, attempts, created_at) \
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    &message_id,
                    backend_bot_id,
                    DeliveryState::Pending.as_str(),
                    &now,
                ],
            )?;
            Ok(true)
        })
    }

    /// Upsert the per-backend nudge row (at most one per backend). Successive
    /// ingress slides the debounce window forward; a FAILED row is revived
    /// from scratch and a SENDING row is reclaimed for the next worker pass.
    pub fn schedule_webhook_nudge(
        &self,
        backend_bot_id: &str,
        chat_bot_id: &str,
        dedupe_key: &str,
        debounce_seconds: f64,
    ) -> rusqlite::Result<()> {
        let now = chrono::Utc::now();
        let debounce_ms = (debounce_seconds.max(0.0) * 1000.0).round() as i64;
        let next_attempt_at = (now + chrono::Duration::milliseconds(debounce_ms)).to_rfc3339();
        let now = now.to_rfc3339();

        self.db.with_tx(|tx| {
            let existing: Option<(String, String)> = tx
                .query_row(
                    "SELECT id, state FROM webhook_nudges WHERE backend_bot_id = ?1",
                    params![backend_bot_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO webhook_nudges (id, backend_bot_id, chat_bot_id, \
                         last_dedupe_key, state, attempts, next_attempt_at, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?7)",
                        params![
                            uuid::Uuid::new_v4().to_string(),
                            backend_bot_id,
                            chat_bot_id,
                            dedupe_key,
                            NudgeState::Pending.as_str(),
                            &next_attempt_at,
                            &now,
                        ],
                    )?;
                }
                Some((id, state)) => match NudgeState::parse(&state) {
                    Some(NudgeState::Failed) => {
                        tx.execute(
                            "UPDATE webhook_nudges SET chat_bot_id = ?1, last_dedupe_key = ?2, \
                             next_attempt_at = ?3, updated_at = ?4, state = ?5, attempts = 0, \
                             last_error = NULL WHERE id = ?6",
                            params![
                                chat_bot_id,
                                dedupe_key,
                                &next_attempt_at,
                                &now,
                                NudgeState::Pending.as_str(),
                                &id,
                            ],
                        )?;
                    }
                    // SENDING keeps its attempts so prior progress stays
                    // observable, but goes back to PENDING for pickup.
                    _ => {
                        tx.execute(
                            "UPDATE webhook_nudges SET chat_bot_id = ?1, last_dedupe_key = ?2, \
                             next_attempt_at = ?3, updated_at = ?4, state = ?5 WHERE id = ?6",
                            params![
                                chat_bot_id,
                                dedupe_key,
                                &next_attempt_at,
                                &now,
                                NudgeState::Pending.as_str(),
                                &id,
                            ],
                        )?;
                    }
                },
            }
            Ok(())
        })
    }

    /// Legacy pull: transition PENDING deliveries straight to DELIVERED and
    /// return them. At-most-once; new consumers should use lease/ack.
    pub fn fetch_and_mark_delivered(
        &self,
        backend_bot_id: &str,
        limit: i64,
    ) -> rusqlite::Result<Vec<DeliveryRecord>> {
        let now = chrono::Utc::now().to_rfc3339();
        self.db.with_tx(|tx| {
            let records = select_pending(tx, backend_bot_id, limit)?;
            let ids: Vec<&str> = records.iter().map(|r| r.delivery_id.as_str()).collect();
            update_deliveries_by_id(
                tx,
                &ids,
                "state = ?1, delivered_at = ?2",
                params![DeliveryState::Delivered.as_str(), &now],
            )?;
            Ok(records)
        })
    }

    /// Lease up to `limit` pending deliveries in creation order. All leased
    /// records share one fresh lease_id and expiry. When requested, also
    /// returns channel history anchored at the first leased message that has
    /// a channel, chronological order, unfiltered by state or backend.
    pub fn lease_messages(
        &self,
        backend_bot_id: &str,
        limit: i64,
        lease_seconds: i64,
        include_conversation_history: bool,
        conversation_history_limit: i64,
    ) -> rusqlite::Result<(Vec<LeasedDeliveryRecord>, Vec<ChatMessageRecord>)> {
        let now = chrono::Utc::now();
        let lease_id = uuid::Uuid::new_v4().to_string();
        let lease_expires_at = (now + chrono::Duration::seconds(lease_seconds)).to_rfc3339();

        self.db.with_tx(|tx| {
            let pending = select_pending(tx, backend_bot_id, limit)?;
            let ids: Vec<&str> = pending.iter().map(|r| r.delivery_id.as_str()).collect();
            update_deliveries_by_id(
                tx,
                &ids,
                "state = ?1, lease_id = ?2, lease_expires_at = ?3, attempts = attempts + 1",
                params![DeliveryState::Leased.as_str(), &lease_id, &lease_expires_at],
            )?;

            let leased: Vec<LeasedDeliveryRecord> = pending
                .into_iter()
                .map(|record| LeasedDeliveryRecord {
                    delivery_id: record.delivery_id,
                    lease_id: lease_id.clone(),
                    backend_bot_id: record.backend_bot_id,
                    message: record.message,
                    lease_expires_at: lease_expires_at.clone(),
                })
                .collect();

            let mut history = Vec::new();
            if include_conversation_history
                && let Some(anchor) = leased.iter().find(|r| r.message.channel_id.is_some())
            {
                history = channel_history(
                    tx,
                    anchor.message.channel_id.as_deref().unwrap_or_default(),
                    &anchor.message.timestamp,
                    conversation_history_limit,
                )?;
            }

            Ok((leased, history))
        })
    }

    /// Transition matching LEASED deliveries to DELIVERED. Deliveries that
    /// don't match the (backend, lease, state) selector are skipped; the
    /// caller learns via the returned count.
    pub fn acknowledge(
        &self,
        backend_bot_id: &str,
        delivery_ids: &[String],
        lease_id: &str,
    ) -> rusqlite::Result<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        self.db.with_tx(|tx| {
            update_leased_selection(
                tx,
                backend_bot_id,
                delivery_ids,
                lease_id,
                "state = ?1, delivered_at = ?2",
                params![DeliveryState::Delivered.as_str(), &now],
            )
        })
    }

    /// Return matching LEASED deliveries to PENDING with the given reason.
    /// `attempts` is not decremented; it records total lease handouts.
    pub fn negative_acknowledge(
        &self,
        backend_bot_id: &str,
        delivery_ids: &[String],
        lease_id: &str,
        reason: Option<&str>,
    ) -> rusqlite::Result<usize> {
        self.db.with_tx(|tx| {
            update_leased_selection(
                tx,
                backend_bot_id,
                delivery_ids,
                lease_id,
                "state = ?1, lease_id = NULL, lease_expires_at = NULL, last_error = ?2",
                params![DeliveryState::Pending.as_str(), reason],
            )
        })
    }

    /// Release expired leases back to PENDING. Returns the number reaped.
    pub fn reap_expired_leases(&self) -> rusqlite::Result<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        self.db.with_tx(|tx| {
            let count = tx.execute(
                "UPDATE deliveries SET state = ?1, lease_id = NULL, lease_expires_at = NULL, \
                 last_error = 'Lease expired' WHERE state = ?2 AND lease_expires_at < ?3",
                params![
                    DeliveryState::Pending.as_str(),
                    DeliveryState::Leased.as_str(),
                    &now,
                ],
            )?;
            Ok(count)
        })
    }
}

fn message_from_row(row: &Row<'_>, start: usize) -> rusqlite::Result<ChatMessageRecord> {
    Ok(ChatMessageRecord {
        chat_message_id: row.get(start)?,
        chat_bot_id: row.get(start + 1)?,
        author_id: row.get(start + 2)?,
        author_name: row.get(start + 3)?,
        channel_id: row.get(start + 4)?,
        guild_id: row.get(start + 5)?,
        is_dm: row.get(start + 6)?,
        content: row.get(start + 7)?,
        timestamp: row.get(start + 8)?,
    })
}

/// FIFO selection: strictly ascending created_at, ties broken by id. The
/// connection mutex serializes concurrent lease calls, so two callers can
/// never observe the same pending rows.
fn select_pending(
    tx: &Transaction<'_>,
    backend_bot_id: &str,
    limit: i64,
) -> rusqlite::Result<Vec<DeliveryRecord>> {
    let sql = format!(
        "SELECT d.id, d.backend_bot_id, {MESSAGE_COLUMNS} \
         FROM deliveries d JOIN messages m ON m.id = d.message_id \
         WHERE d.backend_bot_id = ?1 AND d.state = ?2 \
         ORDER BY d.created_at ASC, d.id ASC LIMIT ?3"
    );
    let mut stmt = tx.prepare(&sql)?;
    let rows = stmt.query_map(
        params![backend_bot_id, DeliveryState::Pending.as_str(), limit],
        |row| {
            Ok(DeliveryRecord {
                delivery_id: row.get(0)?,
                backend_bot_id: row.get(1)?,
                message: message_from_row(row, 2)?,
            })
        },
    )?;
    rows.collect()
}

fn update_deliveries_by_id(
    tx: &Transaction<'_>,
    ids: &[&str],
    set_clause: &str,
    set_params: &[&dyn rusqlite::types::ToSql],
) -> rusqlite::Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let offset = set_params.len();
    let placeholders: Vec<String> = (0..ids.len())
        .map(|i| format!("?{}", offset + i + 1))
        .collect();
    let sql = format!(
        "UPDATE deliveries SET {set_clause} WHERE id IN ({})",
        placeholders.join(",")
    );
    let mut bound: Vec<&dyn rusqlite::types::ToSql> = set_params.to_vec();
    for id in ids {
        bound.push(id);
    }
    tx.execute(&sql, bound.as_slice())
}

fn update_leased_selection(
    tx: &Transaction<'_>,
    backend_bot_id: &str,
    delivery_ids: &[String],
    lease_id: &str,
    set_clause: &str,
    set_params: &[&dyn rusqlite::types::ToSql],
) -> rusqlite::Result<usize> {
    if delivery_ids.is_empty() {
        return Ok(0);
    }
    let offset = set_params.len();
    let placeholders: Vec<String> = (0..delivery_ids.len())
        .map(|i| format!("?{}", offset + i + 4))
        .collect();
    let sql = format!(
        "UPDATE deliveries SET {set_clause} \
         WHERE backend_bot_id = ?{} AND lease_id = ?{} AND state = ?{} AND id IN ({})",
        offset + 1,
        offset + 2,
        offset + 3,
        placeholders.join(",")
    );
    let leased = DeliveryState::Leased.as_str();
    let mut bound: Vec<&dyn rusqlite::types::ToSql> = set_params.to_vec();
    bound.push(&backend_bot_id);
    bound.push(&lease_id);
    bound.push(&leased);
    for id in delivery_ids {
        bound.push(id);
    }
    tx.execute(&sql, bound.as_slice())
}

/// Recent messages in the anchor channel at or before the anchor timestamp,
/// most recent first, reversed to chronological order. History reflects the
/// whole recorded stream, not just this backend's deliveries.
fn channel_history(
    tx: &Transaction<'_>,
    channel_id: &str,
    anchor_timestamp: &str,
    limit: i64,
) -> rusqlite::Result<Vec<ChatMessageRecord>> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages m \
         WHERE m.channel_id = ?1 AND m.timestamp <= ?2 \
         ORDER BY m.timestamp DESC LIMIT ?3"
    );
    let mut stmt = tx.prepare(&sql)?;
    let rows = stmt.query_map(params![channel_id, anchor_timestamp, limit], |row| {
        message_from_row(row, 0)
    })?;
    let mut history: Vec<ChatMessageRecord> = rows.collect::<rusqlite::Result<_>>()?;
    history.reverse();
    Ok(history)
}
