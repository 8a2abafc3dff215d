//! Local store adapter: converts raw, noisy vault notifications into a
//! clean, de-duplicated stream of `file-updated` / `task-cache-updated`
//! events.
//!
//! Create, delete and rename are low-frequency and emitted immediately.
//! Modify and metadata-changed are trailing-edge debounced per path, with
//! self-inflicted writes swallowed through the [`WriteSuppressor`]. Metadata
//! resolution goes through one shared batch window so a bulk resolve (e.g.
//! at startup) costs the downstream indexer a single event.

use crate::debounce::DebounceRegistry;
use crate::event::{EventBus, EventPayload, Subscription, Topic};
use crate::suppression::WriteSuppressor;
use crate::types::{BatchStats, ChangeReason};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Fixed tuning knobs for the vault source.
#[derive(Debug, Clone)]
pub struct VaultSourceConfig {
	/// Quiet period before a modify/metadata change is emitted.
	pub debounce_delay: Duration,
	/// Quiet period for the shared metadata-resolve batch; slightly longer
	/// than the per-path delay so bulk resolves coalesce fully.
	pub batch_delay: Duration,
	/// How long after write-complete trailing notifications stay swallowed.
	pub suppression_grace: Duration,
	/// Upper bound on suppression when write-complete never arrives.
	pub suppression_ceiling: Duration,
	/// Extensions the task indexer cares about.
	pub relevant_extensions: HashSet<String>,
	/// Extensions rejected outright (editor junk).
	pub ignored_extensions: HashSet<String>,
}

impl Default for VaultSourceConfig {
	fn default() -> Self {
		Self {
			debounce_delay: Duration::from_millis(300),
			batch_delay: Duration::from_millis(400),
			suppression_grace: Duration::from_millis(500),
			suppression_ceiling: Duration::from_secs(5),
			relevant_extensions: ["md", "canvas"].iter().map(|s| s.to_string()).collect(),
			ignored_extensions: ["tmp", "swp", "log"].iter().map(|s| s.to_string()).collect(),
		}
	}
}

impl VaultSourceConfig {
	/// Pure, total relevance filter: every input maps to a boolean, no
	/// error path.
	pub fn is_relevant(&self, path: &Path) -> bool {
		if path.file_name().is_none() {
			return false;
		}

		// Hidden/system paths anywhere in the tree.
		if path.iter().any(|component| {
			component
				.to_str()
				.map_or(false, |s| s.starts_with('.') && s.len() > 1)
		}) {
			return false;
		}

		let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
			return false;
		};
		let extension = extension.to_ascii_lowercase();

		if self.ignored_extensions.contains(&extension) {
			return false;
		}
		self.relevant_extensions.contains(&extension)
	}
}

/// Snapshot of the source's internal counters, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultSourceStats {
	pub pending_file_changes: usize,
	pub pending_metadata_changes: usize,
	pub pending_batch: usize,
	pub events_emitted: u64,
	pub notifications_swallowed: u64,
}

/// Change-source adapter for the local document store.
pub struct VaultSource {
	bus: EventBus,
	config: VaultSourceConfig,
	suppressor: Arc<WriteSuppressor>,
	/// Per-path debounce for content modifications.
	file_changes: DebounceRegistry<PathBuf>,
	/// Per-path debounce for frontmatter/metadata changes.
	metadata_changes: DebounceRegistry<PathBuf>,
	/// Single shared window for the metadata-resolve batch.
	batch_window: DebounceRegistry<()>,
	pending_batch: Arc<Mutex<BTreeSet<PathBuf>>>,
	workspace_ready: AtomicBool,
	events_emitted: Arc<AtomicU64>,
	notifications_swallowed: AtomicU64,
	subscriptions: Mutex<Vec<Subscription>>,
}

fn emit_file_updated(bus: &EventBus, emitted: &AtomicU64, path: PathBuf, reason: ChangeReason) {
	trace!(path = %path.display(), reason = reason.as_ref(), "Emitting file update");
	emitted.fetch_add(1, Ordering::Relaxed);
	bus.publish(EventPayload::FileUpdated { path, reason });
}

fn emit_batch(bus: &EventBus, emitted: &AtomicU64, changed_files: Vec<PathBuf>) {
	if changed_files.is_empty() {
		return;
	}

	debug!(files = changed_files.len(), "Emitting batch update");
	emitted.fetch_add(1, Ordering::Relaxed);
	let stats = BatchStats {
		total: changed_files.len(),
		changed: changed_files.len(),
	};
	bus.publish(EventPayload::TaskCacheUpdated {
		changed_files,
		stats,
	});
}

impl VaultSource {
	pub fn new(bus: EventBus, config: VaultSourceConfig) -> Arc<Self> {
		let suppressor = Arc::new(WriteSuppressor::new(
			config.suppression_grace,
			config.suppression_ceiling,
		));
		let events_emitted = Arc::new(AtomicU64::new(0));
		let pending_batch = Arc::new(Mutex::new(BTreeSet::new()));

		let file_changes = {
			let bus = bus.clone();
			let emitted = Arc::clone(&events_emitted);
			DebounceRegistry::new(config.debounce_delay, move |path| {
				emit_file_updated(&bus, &emitted, path, ChangeReason::Modify);
			})
		};

		let metadata_changes = {
			let bus = bus.clone();
			let emitted = Arc::clone(&events_emitted);
			DebounceRegistry::new(config.debounce_delay, move |path| {
				emit_file_updated(&bus, &emitted, path, ChangeReason::Frontmatter);
			})
		};

		let batch_window = {
			let bus = bus.clone();
			let emitted = Arc::clone(&events_emitted);
			let pending = Arc::clone(&pending_batch);
			DebounceRegistry::new(config.batch_delay, move |()| {
				let files: Vec<PathBuf> = std::mem::take(&mut *pending.lock()).into_iter().collect();
				emit_batch(&bus, &emitted, files);
			})
		};

		Arc::new(Self {
			bus,
			config,
			suppressor,
			file_changes,
			metadata_changes,
			batch_window,
			pending_batch,
			workspace_ready: AtomicBool::new(false),
			events_emitted,
			notifications_swallowed: AtomicU64::new(0),
			subscriptions: Mutex::new(Vec::new()),
		})
	}

	/// Wire the write-suppression bracket: `write-operation-start` and
	/// `write-operation-complete` signals from the write API mute the
	/// corresponding path. Idempotent.
	pub fn initialize(self: &Arc<Self>) {
		let mut subscriptions = self.subscriptions.lock();
		if !subscriptions.is_empty() {
			return;
		}

		let suppressor = Arc::clone(&self.suppressor);
		subscriptions.push(self.bus.subscribe(Topic::WriteStarted, move |envelope| {
			if let EventPayload::WriteStarted { path } = &envelope.payload {
				suppressor.mark_started(path.clone());
			}
			Ok(())
		}));

		let suppressor = Arc::clone(&self.suppressor);
		subscriptions.push(self.bus.subscribe(Topic::WriteCompleted, move |envelope| {
			if let EventPayload::WriteCompleted { path } = &envelope.payload {
				suppressor.mark_completed(path);
			}
			Ok(())
		}));

		info!("Vault source initialized");
	}

	/// The store layout is ready; create notifications are accepted from now
	/// on. Before this, startup churn of create events is dropped.
	pub fn mark_workspace_ready(&self) {
		self.workspace_ready.store(true, Ordering::SeqCst);
	}

	/// File created. Emitted immediately, gated on workspace readiness.
	pub fn on_create(&self, path: &Path) {
		if !self.config.is_relevant(path) {
			return;
		}
		if !self.workspace_ready.load(Ordering::SeqCst) {
			debug!(path = %path.display(), "Dropping create before workspace ready");
			return;
		}

		emit_file_updated(
			&self.bus,
			&self.events_emitted,
			path.to_path_buf(),
			ChangeReason::Create,
		);
	}

	/// File deleted. Cancels any pending debounce for the path, then emits
	/// immediately.
	pub fn on_delete(&self, path: &Path) {
		if !self.config.is_relevant(path) {
			return;
		}

		self.file_changes.cancel(&path.to_path_buf());
		self.metadata_changes.cancel(&path.to_path_buf());

		emit_file_updated(
			&self.bus,
			&self.events_emitted,
			path.to_path_buf(),
			ChangeReason::Delete,
		);
	}

	/// File renamed/moved. Emits delete(old) then rename(new), in that
	/// order, so the downstream indexer can retire and recreate the entry
	/// atomically; a pending debounce for the old path is canceled so no
	/// late modify fires for it.
	pub fn on_rename(&self, old_path: &Path, new_path: &Path) {
		if !self.config.is_relevant(new_path) {
			return;
		}

		let old = old_path.to_path_buf();
		self.file_changes.cancel(&old);
		self.metadata_changes.cancel(&old);

		debug!(
			old = %old_path.display(),
			new = %new_path.display(),
			"File renamed"
		);

		emit_file_updated(&self.bus, &self.events_emitted, old, ChangeReason::Delete);
		emit_file_updated(
			&self.bus,
			&self.events_emitted,
			new_path.to_path_buf(),
			ChangeReason::Rename,
		);
	}

	/// File content modified. Suppression-checked, then debounced per path
	/// with restart semantics.
	pub fn on_modify(&self, path: &Path) {
		if !self.config.is_relevant(path) {
			return;
		}
		if self.swallow_if_suppressed(path, "modify") {
			return;
		}

		self.file_changes.arm(path.to_path_buf());
	}

	/// Frontmatter/metadata changed. Same treatment as modify, separate
	/// debounce keyspace so a metadata change cannot eat a content change.
	pub fn on_metadata_changed(&self, path: &Path) {
		if !self.config.is_relevant(path) {
			return;
		}
		if self.swallow_if_suppressed(path, "metadata") {
			return;
		}

		self.metadata_changes.arm(path.to_path_buf());
	}

	/// Metadata resolved (bulk, usually after an initial scan). Accumulated
	/// into the shared batch window.
	pub fn on_metadata_resolved(&self, path: &Path) {
		if !self.config.is_relevant(path) {
			return;
		}

		self.pending_batch.lock().insert(path.to_path_buf());
		self.batch_window.arm(());
	}

	/// Synchronously fire every pending debounce and the batch window.
	/// Nothing pending is silently dropped on teardown; a second flush with
	/// no intervening notifications is a no-op.
	pub fn flush(&self) {
		debug!("Flushing all pending changes");
		self.file_changes.flush();
		self.metadata_changes.flush();
		self.batch_window.flush();
	}

	/// Manual escape hatch: emit a file update immediately, bypassing
	/// debouncing and suppression.
	pub fn trigger_file_update(&self, path: PathBuf, reason: ChangeReason) {
		emit_file_updated(&self.bus, &self.events_emitted, path, reason);
	}

	/// Manual escape hatch: emit a batch update immediately. An empty batch
	/// is a no-op.
	pub fn trigger_batch_update(&self, paths: Vec<PathBuf>) {
		emit_batch(&self.bus, &self.events_emitted, paths);
	}

	/// Current counters.
	pub fn stats(&self) -> VaultSourceStats {
		VaultSourceStats {
			pending_file_changes: self.file_changes.pending(),
			pending_metadata_changes: self.metadata_changes.pending(),
			pending_batch: self.pending_batch.lock().len(),
			events_emitted: self.events_emitted.load(Ordering::Relaxed),
			notifications_swallowed: self.notifications_swallowed.load(Ordering::Relaxed),
		}
	}

	/// Tear down: drop every timer, drain the batch set and unsubscribe from
	/// the write bracket. Pending debounces are discarded, not fired; call
	/// [`flush`](Self::flush) first for a consistent shutdown.
	pub fn destroy(&self) {
		self.file_changes.clear();
		self.metadata_changes.clear();
		self.batch_window.clear();
		self.pending_batch.lock().clear();
		self.suppressor.clear();

		for mut subscription in self.subscriptions.lock().drain(..) {
			subscription.dispose();
		}

		info!("Vault source destroyed");
	}

	fn swallow_if_suppressed(&self, path: &Path, kind: &str) -> bool {
		if self.suppressor.is_suppressed(path) {
			self.notifications_swallowed.fetch_add(1, Ordering::Relaxed);
			debug!(path = %path.display(), kind, "Swallowing notification for suppressed path");
			true
		} else {
			false
		}
	}
}

// Dropping the source without an explicit destroy must still not leave
// orphaned timers firing into the bus.
impl Drop for VaultSource {
	fn drop(&mut self) {
		self.destroy();
	}
}
