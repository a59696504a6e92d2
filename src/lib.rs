//! Library root for the `hermes` crate: telemetry pipeline and streaming
//! transfer engine for a storage-management service.

// Core error handling
pub mod api_errors;
pub mod errors;

// Telemetry
pub mod event_log;
pub mod logging;
pub mod metrics;
pub mod ring;
pub mod telemetry_store;
pub mod telemetry_store_sled;
pub mod trace_store;

// Derived views
pub mod aggregate;

// Storage & transfers
pub mod endpoints;
pub mod object_store;
pub mod object_store_fs;
pub mod object_store_memory;
pub mod transfer;

// Configuration & CLI
pub mod cli;
pub mod config_loader;

// Web server interface
pub mod api;
pub mod app_state;
pub mod identity;
pub mod middleware;
pub mod web;

/// Build a [`event_log::Fields`] map: `fields!("key" => value, ...)`.
/// Values go through `serde_json::json!`.
#[macro_export]
macro_rules! fields {
    () => {
        $crate::event_log::Fields::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::event_log::Fields::new();
        $(
            map.insert(::std::string::String::from($key), ::serde_json::json!($value));
        )+
        map
    }};
}

pub use app_state::{AppState, SharedState};
pub use errors::{HermesError, HermesResult};
pub use event_log::{EventLog, LogEntry, LogLevel};
pub use trace_store::{Trace, TraceEvent, TraceStore};
pub use transfer::{TransferEngine, TransferFrame, TransferMode};
pub use web::build_router;
