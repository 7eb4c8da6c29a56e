//! Client-side state for a remote batch run: the entity registry, the run
//! log, status reconciliation, and the lifecycle controller, all owned by one
//! actor task and exposed through [`MonitorHandle`].

mod collaborators;
mod config;
mod controller;
mod error;
mod ingest;
mod reconcile;
mod registry;
mod runtime;
mod state;
mod view;

pub use collaborators::{EntitySource, LogSink, LogSubscription, RemoteEngine};
pub use config::MonitorConfig;
pub use controller::{BatchController, StopTransition};
pub use error::{MonitorError, MonitorResult, RemoteError, SourceError};
pub use ingest::{RunLog, DEFAULT_LOG_CAPACITY};
pub use reconcile::{apply_snapshot, merge_result, MergeOutcome, ReconcileReport};
pub use registry::{EntityRegistry, RegistryReload};
pub use runtime::{Monitor, MonitorHandle, StopOutcome};
pub use state::{Ingested, MonitorState};
pub use view::{Counters, EntityRow, ViewModel};
