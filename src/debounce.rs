//! Generic per-key trailing-edge debounce.
//!
//! A [`DebounceRegistry`] keeps one cancelable deferred task per key. Arming
//! an already-armed key restarts its delay (no queuing), so a burst of
//! notifications for the same key collapses to a single fire once the key
//! has been quiet for the full delay. The registry is shared by the per-path
//! and the batch debounce cases.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::trace;

struct PendingTimer {
	generation: u64,
	handle: JoinHandle<()>,
}

struct Inner<K> {
	delay: Duration,
	timers: Mutex<HashMap<K, PendingTimer>>,
	// Distinguishes a live timer from a stale task that lost an abort race.
	generation: AtomicU64,
	on_fire: Box<dyn Fn(K) + Send + Sync>,
}

/// Map of key → restartable deferred task with a shared fire callback.
pub struct DebounceRegistry<K> {
	inner: Arc<Inner<K>>,
}

impl<K> Clone for DebounceRegistry<K> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<K> DebounceRegistry<K>
where
	K: Eq + Hash + Ord + Clone + Send + Sync + 'static,
{
	/// Create a registry firing `on_fire(key)` after `delay` of quiet per key.
	pub fn new(delay: Duration, on_fire: impl Fn(K) + Send + Sync + 'static) -> Self {
		Self {
			inner: Arc::new(Inner {
				delay,
				timers: Mutex::new(HashMap::new()),
				generation: AtomicU64::new(0),
				on_fire: Box::new(on_fire),
			}),
		}
	}

	/// (Re)start the delay for `key`. Must be called from within a tokio
	/// runtime.
	pub fn arm(&self, key: K) {
		let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
		let mut timers = self.inner.timers.lock();

		if let Some(previous) = timers.remove(&key) {
			previous.handle.abort();
			trace!("Debounce timer restarted");
		}

		let inner = Arc::clone(&self.inner);
		let task_key = key.clone();
		let handle = tokio::spawn(async move {
			sleep(inner.delay).await;

			// Fire only if our entry is still the live one for this key; a
			// newer arm, a cancel or a flush invalidates it.
			let still_live = {
				let mut timers = inner.timers.lock();
				match timers.get(&task_key) {
					Some(timer) if timer.generation == generation => {
						timers.remove(&task_key);
						true
					}
					_ => false,
				}
			};

			if still_live {
				(inner.on_fire)(task_key);
			}
		});

		timers.insert(key, PendingTimer { generation, handle });
	}

	/// Cancel the pending timer for `key` without firing. Returns whether a
	/// timer was pending.
	pub fn cancel(&self, key: &K) -> bool {
		match self.inner.timers.lock().remove(key) {
			Some(timer) => {
				timer.handle.abort();
				true
			}
			None => false,
		}
	}

	/// Synchronously fire every pending timer, in key order, and drain the
	/// registry. Calling twice in a row fires nothing on the second call.
	pub fn flush(&self) {
		let mut keys: Vec<K> = {
			let mut timers = self.inner.timers.lock();
			timers
				.drain()
				.map(|(key, timer)| {
					timer.handle.abort();
					key
				})
				.collect()
		};
		keys.sort();

		for key in keys {
			(self.inner.on_fire)(key);
		}
	}

	/// Drop every pending timer without firing.
	pub fn clear(&self) {
		for (_, timer) in self.inner.timers.lock().drain() {
			timer.handle.abort();
		}
	}

	/// Number of pending timers.
	pub fn pending(&self) -> usize {
		self.inner.timers.lock().len()
	}

	/// Whether `key` currently has a pending timer.
	pub fn is_pending(&self, key: &K) -> bool {
		self.inner.timers.lock().contains_key(key)
	}
}
