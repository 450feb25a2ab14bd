pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    CacheConfig, Config, ConfigMetadata, CorsConfig, DatabaseConfig,
    GatewaySettings, OrchestratorSettings, RunnerSettings, ServerConfig,
    SweepConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
