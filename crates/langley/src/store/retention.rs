//! Periodic TTL expiry. The scheduler only enqueues sweep work; the writer
//! executes the deletes so row mutation stays single-owner.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use super::queue::{PersistQueue, WorkItem};

pub async fn run(
	queue: Arc<PersistQueue>,
	interval_minutes: u64,
	mut shutdown: watch::Receiver<bool>,
) {
	let period = Duration::from_secs(interval_minutes.max(1) * 60);
	let mut tick = tokio::time::interval(period);
	tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
	// The first tick fires immediately; sweep once at startup to clear
	// anything that expired while the proxy was down.
	loop {
		tokio::select! {
			_ = tick.tick() => {
				queue.push(WorkItem::RetentionSweep(Utc::now()));
			},
			_ = shutdown.changed() => break,
		}
	}
}
