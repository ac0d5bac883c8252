//! Application wiring
//!
//! `initialize` loads configuration, opens the pool, prepares the schema and
//! returns an [`Application`] holding every service. Callers keep the
//! application and hand its services to wherever they are needed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::catalog::{ProcessCatalog, SqlProcessCatalog};
use crate::config::Config;
use crate::db;
use crate::executions::ExecutionService;
use crate::processes::ProcessService;
use crate::stats::StatsService;
use crate::workflow_state::{LocalWorkflowStates, WorkflowStateProvider};

/// The engine with all services
pub struct Application {
    pub config: Config,
    pub pool: SqlitePool,
    pub executions: ExecutionService,
    pub processes: ProcessService,
    pub stats: StatsService,
}

impl Application {
    /// Build services over an open pool (no I/O)
    ///
    /// Process definitions are read from the engine's own tables.
    pub fn new(config: Config, pool: SqlitePool, states: Arc<dyn WorkflowStateProvider>) -> Self {
        let catalog = Arc::new(SqlProcessCatalog::new(pool.clone()));
        Self::with_catalog(config, pool, catalog, states)
    }

    /// Build services with an external process catalog
    pub fn with_catalog(
        config: Config,
        pool: SqlitePool,
        catalog: Arc<dyn ProcessCatalog>,
        states: Arc<dyn WorkflowStateProvider>,
    ) -> Self {
        let executions =
            ExecutionService::new(pool.clone(), catalog, states, config.engine.clone());

        Self {
            executions,
            processes: ProcessService::new(pool.clone()),
            stats: StatsService::new(pool.clone()),
            config,
            pool,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Options for initializing the engine
#[derive(Clone)]
pub struct InitOptions {
    /// Database URL (overrides config file and env vars)
    pub database_url: Option<String>,

    /// Config file path (overrides default search)
    pub config_path: Option<PathBuf>,

    /// Whether to run migrations on startup
    pub auto_migrate: bool,

    /// Whether to fail if the schema is missing (when auto_migrate is false)
    pub require_initialized: bool,

    /// Workflow-state provider; in-process handles when unset
    pub workflow_states: Option<Arc<dyn WorkflowStateProvider>>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            database_url: None,
            config_path: None,
            auto_migrate: true,
            require_initialized: true,
            workflow_states: None,
        }
    }
}

/// Builder for constructing InitOptions
#[derive(Default)]
pub struct InitBuilder {
    options: InitOptions,
}

impl InitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.options.database_url = Some(url.into());
        self
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn auto_migrate(mut self, auto: bool) -> Self {
        self.options.auto_migrate = auto;
        self
    }

    pub fn require_initialized(mut self, required: bool) -> Self {
        self.options.require_initialized = required;
        self
    }

    pub fn workflow_states(mut self, states: Arc<dyn WorkflowStateProvider>) -> Self {
        self.options.workflow_states = Some(states);
        self
    }

    pub async fn init(self) -> Result<Application> {
        initialize(self.options).await
    }
}

/// Initialize the engine and return an Application instance
pub async fn initialize(options: InitOptions) -> Result<Application> {
    let config = Config::builder()
        .database_url(options.database_url)
        .config_path(options.config_path)
        .build()?;

    let pool = db::create_pool(&config.database).await?;

    if options.auto_migrate {
        db::migrate(&pool)
            .await
            .context("Failed to run automatic migrations")?;
    } else if options.require_initialized {
        db::check_initialized(&pool).await.context(
            "Database is not initialized. Run 'sopline migrate' or enable auto_migrate",
        )?;
    }

    let states = options
        .workflow_states
        .unwrap_or_else(|| Arc::new(LocalWorkflowStates::new()));

    tracing::info!(
        max_connections = config.database.max_connections,
        auto_migrate = options.auto_migrate,
        "engine initialized"
    );
    Ok(Application::new(config, pool, states))
}
