//! testrelay: dispatch requirement test runs to CI and reconcile the results.
//!
//! A run is started through [`ExecutionCoordinator::start`]. Results may
//! arrive over a push connection to the result relay, by polling the relay,
//! by polling the CI run itself, or from the simulated generator; whichever
//! channel delivers first, each test case is written to the record store once
//! per status change and the caller always gets exactly one terminal outcome.

pub mod backend;
pub mod channels;
pub mod ci;
pub mod coordinator;
pub mod error;
pub mod journal;
pub mod model;
pub mod reconcile;
pub mod registry;
pub mod relay;
pub mod settings;
pub mod timeout;

pub use coordinator::{
    ExecutionCoordinator, ExecutionCoordinatorBuilder, ExecutionHandle, ExecutionMode,
    ExecutionOptions,
};
pub use error::{
    ChannelError, ConfigurationError, DispatchError, ExecutionError, ReconciliationError,
    StoreError,
};
pub use model::{
    CancelReason, ChannelKind, ExecutionOutcome, ExecutionReport, ExecutionState,
    ExecutionSummary, RequestId, SubjectId, TestResult, TestStatus,
};
pub use reconcile::{InMemoryRecordStore, RecordStore, Reconciler, TestCase};
pub use registry::{CorrelationRegistry, Delivery, SubscriptionKey};
pub use settings::Settings;
pub use timeout::TimeoutConfig;
