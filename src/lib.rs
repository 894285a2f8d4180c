//! Capture-and-history core of the inkstone desktop utility: observes
//! typing activity across applications, reconstructs committed text
//! fragments and persists them as a local queryable activity log.
//!
//! The pipeline is two serialized owners joined by channels: the activity
//! monitor (key/focus events in, `UsageRecord`s out) and the history store
//! (records in, debounced atomic file writes out).

pub mod config;
pub mod events;
pub mod introspect;
pub mod monitor;
pub mod platform;
pub mod record;
pub mod store;

pub use events::{FocusChange, KeyEvent, Modifiers, MonitorEvent};
pub use introspect::{FocusedText, IntrospectionClient};
pub use monitor::{ActivityMonitor, EventSource, MonitorConfig};
pub use record::{UsageRecord, APP_SWITCH_PREFIX};
pub use store::HistoryStore;
