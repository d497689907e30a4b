use std::sync::Arc;

use crate::adapter::transport::build_client;
use crate::adapter::{AdapterRegistry, DispatchAdapter};
use crate::collaborators::{ChannelRegistry, QuotaLedger, TaskStore};
use crate::context::RelayRequest;
use crate::errors::RelayError;
use crate::relay::orchestrator::{self, RelayDeps, RelayOutcome};
use crate::runtime_config::ConfigStore;
use crate::sqlite_store::SqliteStore;
use crate::task::{TaskEngine, TaskView};
use crate::token_provider::TokenProvider;

/// Entry point handed to the routing surface.
pub struct RelayEngine {
    deps: RelayDeps,
}

impl RelayEngine {
    pub fn new(
        registry: Arc<dyn ChannelRegistry>,
        ledger: Arc<dyn QuotaLedger>,
        tasks: Arc<dyn TaskStore>,
        config: Arc<ConfigStore>,
    ) -> Result<Self, String> {
        let http = build_client(&config.snapshot(), None)?;
        let task_engine = Arc::new(TaskEngine::new(tasks, ledger.clone(), config.clone()));
        Ok(Self {
            deps: RelayDeps {
                registry,
                ledger,
                config,
                adapters: AdapterRegistry::default(),
                tokens: Arc::new(TokenProvider::new()),
                tasks: task_engine,
                http,
            },
        })
    }

    /// One SQLite store serving as registry, ledger and task store.
    pub fn with_sqlite(store: Arc<SqliteStore>, config: Arc<ConfigStore>) -> Result<Self, String> {
        Self::new(store.clone(), store.clone(), store, config)
    }

    pub fn relay(&self, request: RelayRequest) -> Result<RelayOutcome, RelayError> {
        orchestrator::relay(&self.deps, request)
    }

    pub fn query_task(&self, owner_id: i64, task_id: &str) -> Result<Option<TaskView>, String> {
        self.deps.tasks.query(owner_id, task_id)
    }

    pub fn is_task_running(&self, task_id: &str) -> bool {
        self.deps.tasks.is_running(task_id)
    }

    pub fn register_adapter<F>(&mut self, provider_type: i64, factory: F)
    where
        F: Fn() -> Box<dyn DispatchAdapter> + Send + Sync + 'static,
    {
        self.deps.adapters.register(provider_type, factory);
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.deps.config
    }
}
