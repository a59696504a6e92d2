use std::sync::Arc;

use crate::config_loader::HermesConfig;
use crate::endpoints::EndpointRegistry;
use crate::errors::HermesResult;
use crate::event_log::EventLog;
use crate::identity::{HeaderIdentity, IdentityResolver};
use crate::metrics::RequestCounters;
use crate::telemetry_store::{DurableLogSink, TelemetryStore};
use crate::telemetry_store_sled::SledTelemetryStore;
use crate::trace_store::TraceStore;
use crate::transfer::TransferEngine;

/// Everything a handler needs, constructed once at startup.
pub struct AppState {
    pub config: HermesConfig,
    pub events: Arc<EventLog>,
    pub telemetry: Arc<dyn TelemetryStore>,
    pub traces: TraceStore,
    pub endpoints: EndpointRegistry,
    pub identity: Arc<dyn IdentityResolver>,
    pub counters: RequestCounters,
    pub transfers: TransferEngine,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        config: HermesConfig,
        events: Arc<EventLog>,
        telemetry: Arc<dyn TelemetryStore>,
        endpoints: EndpointRegistry,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        let traces = TraceStore::new(config.trace.ring_capacity, telemetry.clone());
        let transfers = TransferEngine::new(
            config.transfer.progress_interval(),
            config.transfer.buffer_size,
        );
        Self {
            config,
            events,
            telemetry,
            traces,
            endpoints,
            identity,
            counters: RequestCounters::new(),
            transfers,
        }
    }

    /// Open the sled store under `data_dir`, make it the event log's durable
    /// sink and build the configured endpoints.
    pub fn open(config: HermesConfig, events: Arc<EventLog>) -> HermesResult<Self> {
        if let Some(parent) = config.data_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let telemetry: Arc<dyn TelemetryStore> = Arc::new(SledTelemetryStore::open(&config.data_dir)?);
        events.register_sink(Arc::new(DurableLogSink(telemetry.clone())));

        let endpoints = EndpointRegistry::from_config(&config.endpoints)?;
        Ok(Self::new(
            config,
            events,
            telemetry,
            endpoints,
            Arc::new(HeaderIdentity),
        ))
    }

    /// Stop the log sink and flush durable state.
    pub fn shutdown(&self) -> HermesResult<()> {
        self.events.close_sink();
        self.telemetry.flush()
    }
}
