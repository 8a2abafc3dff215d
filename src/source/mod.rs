//! Change-source adapters feeding the event bus.
//!
//! Each source owns its own lifecycle (initialize/destroy) and translates an
//! external notification stream into bus events with the crate's debouncing,
//! batching and suppression semantics applied.

pub mod calendar;
pub mod vault;

pub use calendar::{CalendarManager, CalendarSource, CalendarSourceConfig, CalendarSourceStats};
pub use vault::{VaultSource, VaultSourceConfig, VaultSourceStats};
