// fleet-core: the concurrent monitoring pipeline for a distributed ledger
// fleet -- connection supervision, ingest processing, fork detection, and
// notification dispatch.

pub mod dispatcher;
pub mod fork;
pub mod model;
pub mod processor;
pub mod supervisor;

pub use dispatcher::{default_known_notifications, DispatcherConfig, TransportFn, TransportRegistry};
pub use fork::{calc_modes, fork_check, ForkAlert, ForkCheckResult};
pub use model::{
    IngestEvent, Notification, NotificationConfig, NotificationQueue, ProcessedValidations,
    ServerRecord, ServerSpec, ServerTable, ValKeys, ValidatorRecord, ValidatorSpec, ValidatorTable,
    DISCONNECTED_STATUS,
};
pub use processor::{ConsoleRenderer, ProcessorConfig, ProcessorError};
pub use supervisor::{SupervisorConfig, SupervisorError};
