use crate::db::Db;
use crate::queue::QueueService;
use std::collections::HashMap;
use std::sync::Arc;

/// Interval between expired-lease sweeps (seconds).
const REAP_INTERVAL_SECS: u64 = 60;

/// Spawns a background task that periodically returns expired leases to
/// pending so crashed or stalled backends don't strand deliveries.
pub fn spawn_reaper(db_path: String) {
    tokio::spawn(async move {
        let db = match Db::open(&db_path) {
            Ok(db) => db,
            Err(e) => {
                eprintln!("⚠️ Lease reaper: failed to open DB: {e}");
                return;
            }
        };
        let queue = QueueService::new(Arc::new(db), HashMap::new());

        loop {
            tokio::time::sleep(std::time::Duration::from_secs(REAP_INTERVAL_SECS)).await;
            match queue.reap_expired_leases() {
                Ok(0) => {}
                Ok(count) => println!("♻️ Reaped {count} expired lease(s)"),
                Err(e) => eprintln!("⚠️ Lease reaper: sweep failed: {e}"),
            }
        }
    });
}
