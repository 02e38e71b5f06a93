//! Observability for the persistency engine
//!
//! - Structured logging (JSON, one line per event)
//! - Typed lifecycle events
//!
//! Observability is read-only: logging never changes the outcome of an
//! operation and never fails it.
//!
//! ```ignore
//! use persistency::observability::{log_event, Event};
//!
//! log_event(Event::KvsSync, &[("storage", "app/settings"), ("changes", "3")]);
//! ```

mod events;
mod logger;

pub use events::Event;
pub use logger::{Logger, Severity};

/// Log a typed event at its own severity.
pub fn log_event(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}
