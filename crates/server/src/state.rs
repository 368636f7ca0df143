//! Shared application state.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use voicebridge_persistence::RedisCallStore;
use voicebridge_pipeline::SessionSupervisor;
use voicebridge_telephony::EventReader;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<SessionSupervisor>,
    /// Concrete store handle for the readiness ping; business access goes
    /// through the supervisor.
    pub redis: Option<Arc<RedisCallStore>>,
    pub tc_reader: Option<Arc<EventReader>>,
    pub metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(supervisor: Arc<SessionSupervisor>, metrics: PrometheusHandle) -> Self {
        Self {
            supervisor,
            redis: None,
            tc_reader: None,
            metrics,
        }
    }

    pub fn with_redis(mut self, redis: Arc<RedisCallStore>) -> Self {
        self.redis = Some(redis);
        self
    }

    pub fn with_tc_reader(mut self, reader: Arc<EventReader>) -> Self {
        self.tc_reader = Some(reader);
        self
    }
}
