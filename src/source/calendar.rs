//! External feed adapter: keeps a locally-cached snapshot of the calendar
//! manager's converted task records fresh.
//!
//! The manager may not exist yet when the source is constructed (it is
//! installed later via [`CalendarSource::set_manager`]), so initialization
//! runs a bounded fixed-interval retry loop alongside a subscription to the
//! manager's own cache-updated signal. Every emission is a full replacement
//! snapshot; a failed load emits an explicit empty-with-error snapshot so
//! consumers never sit on silently stale data.

use crate::event::{EventBus, EventPayload};
use crate::types::{CalendarEvent, CalendarSnapshot, Task};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// The external calendar manager this source pulls from.
#[async_trait]
pub trait CalendarManager: Send + Sync {
	/// Resync with the remote feed and return all current raw events.
	async fn resync_events(&self) -> anyhow::Result<Vec<CalendarEvent>>;

	/// Convert raw feed items into the domain task shape.
	fn events_to_tasks(&self, events: Vec<CalendarEvent>) -> Vec<Task>;
}

/// Fixed retry policy for waiting on the manager to become available.
#[derive(Debug, Clone)]
pub struct CalendarSourceConfig {
	pub retry_interval: Duration,
	pub max_retry_attempts: u32,
}

impl Default for CalendarSourceConfig {
	fn default() -> Self {
		Self {
			retry_interval: Duration::from_secs(1),
			max_retry_attempts: 30,
		}
	}
}

/// Snapshot of the source's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarSourceStats {
	pub initialized: bool,
	pub last_update_seq: u64,
}

/// Change-source adapter for the external calendar feed.
pub struct CalendarSource {
	bus: EventBus,
	config: CalendarSourceConfig,
	manager: RwLock<Option<Arc<dyn CalendarManager>>>,
	initialized: AtomicBool,
	last_update_seq: AtomicU64,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CalendarSource {
	pub fn new(bus: EventBus, config: CalendarSourceConfig) -> Arc<Self> {
		Arc::new(Self {
			bus,
			config,
			manager: RwLock::new(None),
			initialized: AtomicBool::new(false),
			last_update_seq: AtomicU64::new(0),
			tasks: Mutex::new(Vec::new()),
		})
	}

	/// Install (or replace) the calendar manager. The retry loop or the next
	/// cache-updated signal picks it up.
	pub fn set_manager(&self, manager: Arc<dyn CalendarManager>) {
		*self.manager.write() = Some(manager);
	}

	fn manager(&self) -> Option<Arc<dyn CalendarManager>> {
		self.manager.read().clone()
	}

	/// Start listening for calendar updates. Idempotent.
	///
	/// Subscribes to the manager's cache-updated signal first so early
	/// signals are not missed, performs one immediate best-effort load, then
	/// keeps retrying on a fixed interval until the manager shows up or the
	/// attempt budget runs out.
	pub fn initialize(self: &Arc<Self>, mut cache_updates: broadcast::Receiver<()>) {
		if self.initialized.swap(true, Ordering::SeqCst) {
			return;
		}

		info!("Initializing calendar event source");
		let mut tasks = self.tasks.lock();

		let listener = {
			let this = Arc::clone(self);
			tokio::spawn(async move {
				loop {
					match cache_updates.recv().await {
						Ok(()) => {
							debug!("Calendar cache updated, reloading events");
							this.load_and_emit().await;
						}
						Err(broadcast::error::RecvError::Lagged(skipped)) => {
							warn!(skipped, "Missed calendar cache signals, reloading once");
							this.load_and_emit().await;
						}
						Err(broadcast::error::RecvError::Closed) => break,
					}
				}
			})
		};
		tasks.push(listener);

		let retry = {
			let this = Arc::clone(self);
			tokio::spawn(async move {
				// Immediate load is a no-op when the manager is not there yet;
				// the loop below covers late arrival.
				this.load_and_emit().await;
				this.ensure_manager_and_load().await;
			})
		};
		tasks.push(retry);
	}

	async fn ensure_manager_and_load(self: &Arc<Self>) {
		for attempt in 0..self.config.max_retry_attempts {
			if self.manager().is_some() {
				if attempt > 0 {
					debug!(attempt, "Calendar manager became available");
					self.load_and_emit().await;
				}
				return;
			}
			sleep(self.config.retry_interval).await;
		}

		warn!(
			attempts = self.config.max_retry_attempts,
			"Calendar manager not available after retries"
		);
	}

	/// Load from the manager and publish one replacement snapshot. Failures
	/// become an explicit empty-with-error snapshot.
	#[instrument(skip(self))]
	pub async fn load_and_emit(&self) {
		let Some(manager) = self.manager() else {
			debug!("No calendar manager available");
			return;
		};

		match manager.resync_events().await {
			Ok(events) => {
				let tasks = manager.events_to_tasks(events);
				info!(count = tasks.len(), "Loaded calendar events");

				let seq = self
					.bus
					.publish(EventPayload::ExternalEventsUpdated(CalendarSnapshot::replace(
						tasks,
					)));
				self.last_update_seq.store(seq, Ordering::SeqCst);
			}
			Err(e) => {
				error!(?e, "Failed to load calendar events");
				// Clear stale data rather than leaving it silently in place.
				self.bus
					.publish(EventPayload::ExternalEventsUpdated(CalendarSnapshot::error(
						e.to_string(),
					)));
			}
		}
	}

	/// Manual refresh, e.g. from a user action.
	pub async fn refresh(&self) {
		debug!("Manual calendar refresh triggered");
		self.load_and_emit().await;
	}

	/// Current lifecycle state.
	pub fn stats(&self) -> CalendarSourceStats {
		CalendarSourceStats {
			initialized: self.initialized.load(Ordering::SeqCst),
			last_update_seq: self.last_update_seq.load(Ordering::SeqCst),
		}
	}

	/// Stop all background tasks and publish a final empty snapshot marked
	/// destroyed so consumers clear their derived state deterministically.
	pub fn destroy(&self) {
		info!("Destroying calendar event source");

		for task in self.tasks.lock().drain(..) {
			task.abort();
		}

		self.bus
			.publish(EventPayload::ExternalEventsUpdated(
				CalendarSnapshot::destroyed(),
			));
		self.initialized.store(false, Ordering::SeqCst);
	}
}

// Dropping without an explicit destroy still stops the background tasks;
// the final destroyed snapshot is only published by `destroy`.
impl Drop for CalendarSource {
	fn drop(&mut self) {
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::event::{Envelope, Subscription, Topic};
	use tokio::time::advance;

	struct FakeManager {
		fail: AtomicBool,
		events: Vec<CalendarEvent>,
	}

	impl FakeManager {
		fn new(events: Vec<CalendarEvent>) -> Arc<Self> {
			Arc::new(Self {
				fail: AtomicBool::new(false),
				events,
			})
		}
	}

	#[async_trait]
	impl CalendarManager for FakeManager {
		async fn resync_events(&self) -> anyhow::Result<Vec<CalendarEvent>> {
			if self.fail.load(Ordering::SeqCst) {
				anyhow::bail!("feed unreachable");
			}
			Ok(self.events.clone())
		}

		fn events_to_tasks(&self, events: Vec<CalendarEvent>) -> Vec<Task> {
			events
				.into_iter()
				.map(|event| Task {
					id: event.uid,
					content: event.summary,
					due: event.start,
					source_id: Some(event.source_id),
				})
				.collect()
		}
	}

	fn event(uid: &str, source: &str) -> CalendarEvent {
		CalendarEvent {
			uid: uid.to_string(),
			summary: format!("event {uid}"),
			start: None,
			end: None,
			source_id: source.to_string(),
		}
	}

	fn snapshots(bus: &EventBus) -> (Subscription, Arc<Mutex<Vec<Arc<Envelope>>>>) {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = Arc::clone(&seen);
		let sub = bus.subscribe(Topic::ExternalEventsUpdated, move |env| {
			sink.lock().push(Arc::clone(env));
			Ok(())
		});
		(sub, seen)
	}

	fn snapshot_of(envelope: &Envelope) -> &CalendarSnapshot {
		match &envelope.payload {
			EventPayload::ExternalEventsUpdated(snapshot) => snapshot,
			other => panic!("Expected calendar snapshot, got {other:?}"),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn load_emits_replacement_snapshot_with_source_stats() {
		let bus = EventBus::default();
		let source = CalendarSource::new(bus.clone(), CalendarSourceConfig::default());
		let (_sub, seen) = snapshots(&bus);

		source.set_manager(FakeManager::new(vec![
			event("1", "work"),
			event("2", "work"),
			event("3", "home"),
		]));
		source.load_and_emit().await;

		let seen = seen.lock();
		let snapshot = snapshot_of(&seen[0]);
		assert_eq!(snapshot.events.len(), 3);
		assert_eq!(snapshot.stats.sources.get("work"), Some(&2));
		assert_eq!(snapshot.stats.sources.get("home"), Some(&1));
		assert!(snapshot.error.is_none());
		assert_eq!(source.stats().last_update_seq, seen[0].seq);
	}

	#[tokio::test(start_paused = true)]
	async fn failed_load_replaces_with_empty_error_snapshot() {
		let bus = EventBus::default();
		let source = CalendarSource::new(bus.clone(), CalendarSourceConfig::default());
		let (_sub, seen) = snapshots(&bus);

		let manager = FakeManager::new(vec![event("1", "work")]);
		source.set_manager(manager.clone());
		source.load_and_emit().await;

		manager.fail.store(true, Ordering::SeqCst);
		source.refresh().await;

		let seen = seen.lock();
		assert_eq!(seen.len(), 2);
		let snapshot = snapshot_of(&seen[1]);
		assert!(snapshot.events.is_empty());
		assert_eq!(snapshot.error.as_deref(), Some("feed unreachable"));
		assert!(seen[0].seq < seen[1].seq);
	}

	#[tokio::test(start_paused = true)]
	async fn retry_loop_loads_once_manager_appears() {
		let bus = EventBus::default();
		let source = CalendarSource::new(bus.clone(), CalendarSourceConfig::default());
		let (_sub, seen) = snapshots(&bus);
		let (_signal, receiver) = broadcast::channel(4);

		source.initialize(receiver);
		advance(Duration::from_secs(3)).await;
		assert!(seen.lock().is_empty());

		source.set_manager(FakeManager::new(vec![event("1", "work")]));
		advance(Duration::from_secs(2)).await;

		assert_eq!(seen.lock().len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn cache_signal_recovers_after_retry_budget_exhausted() {
		let bus = EventBus::default();
		let source = CalendarSource::new(bus.clone(), CalendarSourceConfig::default());
		let (_sub, seen) = snapshots(&bus);
		let (signal, receiver) = broadcast::channel(4);

		source.initialize(receiver);
		advance(Duration::from_secs(35)).await;
		assert!(seen.lock().is_empty());

		source.set_manager(FakeManager::new(vec![event("1", "work")]));
		signal.send(()).unwrap();
		tokio::task::yield_now().await;

		assert_eq!(seen.lock().len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn initialize_is_idempotent() {
		let bus = EventBus::default();
		let source = CalendarSource::new(bus.clone(), CalendarSourceConfig::default());
		let (signal, _keep_alive) = broadcast::channel::<()>(4);

		source.initialize(signal.subscribe());
		source.initialize(signal.subscribe());

		assert_eq!(source.tasks.lock().len(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn destroy_emits_final_destroyed_snapshot() {
		let bus = EventBus::default();
		let source = CalendarSource::new(bus.clone(), CalendarSourceConfig::default());
		let (_sub, seen) = snapshots(&bus);

		source.set_manager(FakeManager::new(vec![event("1", "work")]));
		source.load_and_emit().await;
		source.destroy();

		let seen = seen.lock();
		assert_eq!(seen.len(), 2);
		let snapshot = snapshot_of(&seen[1]);
		assert!(snapshot.destroyed);
		assert!(snapshot.events.is_empty());
		assert!(!source.stats().initialized);
	}
}
