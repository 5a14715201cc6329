pub mod broker;
pub mod clock;
pub mod config;
pub mod network;
pub mod portal;
pub mod report;
pub mod scheduler;
pub mod sensor;
pub mod store;
pub mod supervisor;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use broker::{BrokerClient, BrokerError, BrokerLink, ConnectOptions, LastWill, QoS};
pub use clock::{elapsed, wait_until, Clock, ManualClock};
pub use config::{
    Config, ConfigError, NetworkMode, NodeSettings, PersistedConfig, ProvisioningSettings,
    SensorKind, WifiCredentials,
};
pub use network::{LinkError, NetworkConnector, NetworkError, PortalOutcome, WifiLink};
pub use report::{Reporter, ReportSummary};
pub use scheduler::MeasurementScheduler;
pub use sensor::SensorReader;
pub use store::{ConfigStore, JsonFileStore, StoreError};
pub use supervisor::Supervisor;
pub use types::{ConnectionState, Reading, SupervisorState};
