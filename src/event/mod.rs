//! Event bus for decoupled communication between change sources and the
//! downstream task indexer.
//!
//! Every published event is stamped with a sequence number from a single
//! shared [`SeqCounter`] before any subscriber runs, so events carry a total
//! order that is meaningful across topics. Delivery is synchronous and
//! in subscription order; each handler is invoked independently so one
//! failing subscriber cannot starve the rest.

use crate::types::{BatchStats, CalendarSnapshot, ChangeReason};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Process-lifetime monotonic sequence counter.
///
/// One instance is injected into the bus and into any producer that needs to
/// pre-stamp data before constructing an envelope. Values are strictly
/// increasing and never reused; gaps across process restarts are fine.
#[derive(Debug, Default)]
pub struct SeqCounter {
	counter: AtomicU64,
}

impl SeqCounter {
	pub fn new() -> Self {
		Self::default()
	}

	/// Allocate the next sequence number.
	pub fn next(&self) -> u64 {
		self.counter.fetch_add(1, Ordering::SeqCst) + 1
	}

	/// Last allocated sequence number (0 if none was allocated yet).
	pub fn current(&self) -> u64 {
		self.counter.load(Ordering::SeqCst)
	}
}

/// Closed set of topics carried by the bus.
///
/// The string names are stable and versioned; consumers must ignore topics
/// they do not know rather than fail on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::AsRefStr)]
pub enum Topic {
	/// A single file needs re-scanning.
	#[serde(rename = "file-updated")]
	FileUpdated,
	/// A batch of files resolved together and the task cache should refresh.
	#[serde(rename = "task-cache-updated")]
	TaskCacheUpdated,
	/// Full replacement snapshot of external calendar events.
	#[serde(rename = "external-events-updated")]
	ExternalEventsUpdated,
	/// An externally-brokered write to a path is about to happen.
	#[serde(rename = "write-operation-start")]
	WriteStarted,
	/// An externally-brokered write to a path finished.
	#[serde(rename = "write-operation-complete")]
	WriteCompleted,
}

impl Topic {
	/// Stable wire name of this topic.
	pub fn as_str(&self) -> &'static str {
		match self {
			Topic::FileUpdated => "file-updated",
			Topic::TaskCacheUpdated => "task-cache-updated",
			Topic::ExternalEventsUpdated => "external-events-updated",
			Topic::WriteStarted => "write-operation-start",
			Topic::WriteCompleted => "write-operation-complete",
		}
	}
}

/// Typed payloads for every event the dataflow core can publish.
#[derive(Debug, Clone, Serialize, Deserialize, strum::AsRefStr)]
#[serde(rename_all_fields = "snake_case")]
pub enum EventPayload {
	FileUpdated {
		path: PathBuf,
		reason: ChangeReason,
	},
	TaskCacheUpdated {
		changed_files: Vec<PathBuf>,
		stats: BatchStats,
	},
	ExternalEventsUpdated(CalendarSnapshot),
	WriteStarted {
		path: PathBuf,
	},
	WriteCompleted {
		path: PathBuf,
	},
}

impl EventPayload {
	/// Topic this payload is published under.
	pub fn topic(&self) -> Topic {
		match self {
			EventPayload::FileUpdated { .. } => Topic::FileUpdated,
			EventPayload::TaskCacheUpdated { .. } => Topic::TaskCacheUpdated,
			EventPayload::ExternalEventsUpdated(_) => Topic::ExternalEventsUpdated,
			EventPayload::WriteStarted { .. } => Topic::WriteStarted,
			EventPayload::WriteCompleted { .. } => Topic::WriteCompleted,
		}
	}
}

/// Immutable event envelope, owned by every subscriber through an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
	pub topic: Topic,
	pub payload: EventPayload,
	pub timestamp: DateTime<Utc>,
	pub seq: u64,
}

type Handler = Arc<dyn Fn(&Arc<Envelope>) -> anyhow::Result<()> + Send + Sync>;

struct SubscriberEntry {
	id: Uuid,
	handler: Handler,
}

#[derive(Default)]
struct BusInner {
	seq: Arc<SeqCounter>,
	subscribers: RwLock<HashMap<Topic, Vec<SubscriberEntry>>>,
}

/// In-memory, transient publish/subscribe bus keyed by [`Topic`].
///
/// Cloning is cheap; clones share the same subscriber table and counter.
/// There is no delivery guarantee across process restarts.
#[derive(Clone, Default)]
pub struct EventBus {
	inner: Arc<BusInner>,
}

impl EventBus {
	/// Create a bus around an injected sequence counter.
	pub fn new(seq: Arc<SeqCounter>) -> Self {
		Self {
			inner: Arc::new(BusInner {
				seq,
				subscribers: RwLock::new(HashMap::new()),
			}),
		}
	}

	/// The shared sequence counter, for producers that pre-stamp data.
	pub fn seq(&self) -> &Arc<SeqCounter> {
		&self.inner.seq
	}

	/// Publish a payload to all current subscribers of its topic.
	///
	/// The sequence number is allocated atomically before any subscriber is
	/// invoked, and the subscriber list is snapshotted at dispatch start so a
	/// handler registered during dispatch never sees the in-flight event.
	/// Publishing with zero subscribers is a no-op success. Returns the
	/// allocated sequence number.
	pub fn publish(&self, payload: EventPayload) -> u64 {
		let topic = payload.topic();
		let seq = self.inner.seq.next();
		let envelope = Arc::new(Envelope {
			topic,
			payload,
			timestamp: Utc::now(),
			seq,
		});

		// Snapshot handlers, then release the lock before invoking them so
		// handlers may publish or (un)subscribe re-entrantly.
		let handlers: Vec<Handler> = {
			let subscribers = self.inner.subscribers.read();
			subscribers
				.get(&topic)
				.map(|entries| entries.iter().map(|e| Arc::clone(&e.handler)).collect())
				.unwrap_or_default()
		};

		for handler in &handlers {
			if let Err(e) = handler(&envelope) {
				error!(
					topic = topic.as_str(),
					seq,
					?e,
					"Subscriber failed handling event"
				);
			}
		}

		debug!(
			topic = topic.as_str(),
			seq,
			subscribers = handlers.len(),
			"Event published"
		);

		seq
	}

	/// Subscribe a handler to a topic. The returned [`Subscription`] removes
	/// the handler when disposed or dropped.
	pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
	where
		F: Fn(&Arc<Envelope>) -> anyhow::Result<()> + Send + Sync + 'static,
	{
		let id = Uuid::new_v4();
		self.inner
			.subscribers
			.write()
			.entry(topic)
			.or_default()
			.push(SubscriberEntry {
				id,
				handler: Arc::new(handler),
			});

		Subscription {
			topic,
			id,
			bus: self.clone(),
			disposed: false,
		}
	}

	/// Number of active subscriptions across all topics.
	pub fn subscriber_count(&self) -> usize {
		self.inner.subscribers.read().values().map(Vec::len).sum()
	}

	fn unsubscribe(&self, topic: Topic, id: Uuid) {
		let mut subscribers = self.inner.subscribers.write();
		if let Some(entries) = subscribers.get_mut(&topic) {
			entries.retain(|e| e.id != id);
		}
	}
}

/// Disposer handle for a bus subscription.
#[must_use = "dropping the subscription unsubscribes the handler"]
pub struct Subscription {
	topic: Topic,
	id: Uuid,
	bus: EventBus,
	disposed: bool,
}

impl Subscription {
	/// Remove the handler from the bus. Idempotent.
	pub fn dispose(&mut self) {
		if !self.disposed {
			self.bus.unsubscribe(self.topic, self.id);
			self.disposed = true;
		}
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		self.dispose();
	}
}
