mod lock_utils;

pub mod adapter;
pub mod context;
pub mod engine;
pub mod errors;
pub mod relay;
pub mod runtime_config;
pub mod task;
#[path = "store/collaborators.rs"]
pub mod collaborators;
#[path = "store/sqlite_store.rs"]
pub mod sqlite_store;
#[path = "auth/token_provider.rs"]
pub mod token_provider;

pub use context::{RelayRequest, RequestContext};
pub use engine::RelayEngine;
pub use errors::{FaultKind, NormalizedError, RelayError};
pub use relay::orchestrator::{RelayOutcome, RelayResponse};
pub use runtime_config::{ConfigStore, RelayConfig};
pub use sqlite_store::SqliteStore;
pub use task::{TaskSubmission, TaskView};
