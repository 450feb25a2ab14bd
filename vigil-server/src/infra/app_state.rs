use std::{fmt, sync::Arc};

use vigil_core::{EventGateway, JobRegistry};

use crate::infra::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: JobRegistry,
    pub gateway: EventGateway,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("active_jobs", &self.registry.active_count())
            .finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(config: Arc<Config>, registry: JobRegistry) -> Self {
        let gateway = EventGateway::new(registry.clone(), config.gateway_config());
        Self {
            config,
            registry,
            gateway,
        }
    }

    pub fn config(&self) -> &Config {
        self.config.as_ref()
    }
}
