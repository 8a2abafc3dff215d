//! Change-ingestion core for a task dataflow pipeline.
//!
//! A single [`event::EventBus`] carries every change notification, stamped
//! with a globally ordered sequence number. Source adapters under [`source`]
//! translate raw external notifications (vault file events, calendar feed
//! updates) into bus events, applying per-path debouncing, batch windowing
//! and self-write suppression so downstream caches see a quiet, ordered
//! stream instead of raw notification noise.

pub mod debounce;
pub mod event;
pub mod source;
pub mod suppression;
pub mod types;

pub use event::{Envelope, EventBus, EventPayload, Subscription, Topic};
pub use source::{CalendarManager, CalendarSource, VaultSource};
pub use types::{CalendarSnapshot, ChangeReason, Task};
