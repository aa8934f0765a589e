pub mod config;
pub mod controller_client;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod poller;
pub mod reconnect;
pub mod services;

pub use error::MaintenanceError;
pub use events::{MaintenanceEvent, ProgressUpdate};
pub use orchestrator::{
    DeviceSnapshot, MaintenanceOrchestrator, OperationFlags, OperationKind, OperationRequest,
    OrchestratorOptions, Phase,
};
