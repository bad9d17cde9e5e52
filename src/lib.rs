//! # Tycho - Compiler and Executor for Declarative Container Systems
//!
//! Tycho compiles Compose-style application specifications into concrete
//! Kubernetes artifacts (deployments, persistent volumes and claims, services,
//! network policies), applies them atomically with rollback on partial
//! failure, and exposes lifecycle operations over an HTTP API.
//!
//! ## Features
//!
//! - **System Model**: Compose-style input plus registry metadata parsed into
//!   an explicit, GUID-identified `System`
//! - **Projection**: deterministic manifest generation through overridable
//!   templates
//! - **Orchestrator Driver**: ordered apply with full reclamation on failure,
//!   label-scoped status and delete
//! - **App Registry**: product-scoped catalogs with context inheritance and
//!   cached spec resolution
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tycho::config::EngineConfig;
//! use tycho::Tycho;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::load("conf/tycho.yaml")?;
//!     let tycho = Tycho::connect(config).await?;
//!
//!     for status in tycho.status(None).await? {
//!         println!("{} {:?} {:?}", status.name, status.ip_address, status.port);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`template`] - manifest template rendering and environment substitution
//! - [`model`] - the abstract system model and its parser
//! - [`projection`] - system to manifest-set generation
//! - [`driver`] - Kubernetes apply/observe/reclaim driver
//! - [`registry`] - app catalog, product contexts, cached spec resolution
//! - [`config`] - platform configuration and environment overrides
//! - [`api`] - the HTTP surface over the engine

pub mod api;
pub mod config;
pub mod driver;
pub mod model;
pub mod projection;
pub mod registry;
pub mod template;

// Re-export commonly used types for convenience
pub use config::EngineConfig;
pub use driver::{KubernetesDriver, Modification};
pub use model::{
    Container, LaunchRequest, LaunchResult, Principal, ServiceExposure, ServiceStatus, System,
    SystemParser,
};
pub use projection::{ManifestSet, Projection};
pub use registry::{AppMeta, AppRegistry};
pub use template::TemplateEngine;

use log::debug;

/// Current version of Tycho
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Tycho error taxonomy
#[derive(thiserror::Error, Debug)]
pub enum TychoError {
    /// IO error occurred during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The parser rejected the compose input
    #[error("invalid compose specification: {0}")]
    InvalidCompose(String),

    /// A volume reference did not match the pvc:// scheme
    #[error("invalid volume specification: {0}")]
    InvalidVolumeSpec(String),

    /// A services key does not name a declared container
    #[error("services entry '{0}' does not name a declared container")]
    UnknownService(String),

    /// Template missing, malformed, or produced unparseable output
    #[error("template '{template}': {detail}")]
    Template { template: String, detail: String },

    /// The requested product context is not in the registry
    #[error("product context '{0}' not found in registry")]
    ContextNotFound(String),

    /// A context extends a base that is not in the registry
    #[error("context extends undefined base '{0}'")]
    BaseNotFound(String),

    /// The app is not visible in the resolved product catalog
    #[error("app '{0}' is not authorized in this product")]
    AppNotAuthorized(String),

    /// The orchestrator rejected a start step; reclamation was performed
    #[error("unable to start system {system}")]
    Start {
        system: String,
        #[source]
        cause: Box<TychoError>,
    },

    /// A non-404 orchestrator error during reclamation
    #[error("reclamation failed: {0}")]
    Delete(String),

    /// An orchestrator or registry deadline expired
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// Orchestrator API error
    #[error("orchestrator error: {0}")]
    Kube(#[from] kube::Error),

    /// Registry HTTP fetch error
    #[error("registry fetch failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration file problem
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for Tycho operations
pub type Result<T> = std::result::Result<T, TychoError>;

/// An organizing facade over the engine: registry resolution, parsing,
/// projection, and the orchestrator driver behind one set of lifecycle
/// operations.
pub struct Tycho {
    config: EngineConfig,
    registry: AppRegistry,
    driver: KubernetesDriver,
}

impl Tycho {
    /// Connect to the orchestrator and load the app registry.
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        let registry = AppRegistry::load(&config)?;
        let driver = KubernetesDriver::connect(&config).await?;
        Ok(Self {
            config,
            registry,
            driver,
        })
    }

    /// Assemble a facade around an already-connected driver. Used by callers
    /// that manage their own client credentials.
    pub fn with_parts(
        config: EngineConfig,
        registry: AppRegistry,
        driver: KubernetesDriver,
    ) -> Self {
        Self {
            config,
            registry,
            driver,
        }
    }

    /// Current configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The loaded app registry
    pub fn registry(&self) -> &AppRegistry {
        &self.registry
    }

    /// Compile a launch request into a `System` without applying it.
    pub async fn compile(&self, request: LaunchRequest) -> Result<System> {
        let spec = self.resolve_request(request).await?;
        SystemParser::new().parse(&self.config, spec)
    }

    /// Compile and start a system on the compute fabric.
    pub async fn start(&self, request: LaunchRequest) -> Result<LaunchResult> {
        let system = self.compile(request).await?;
        self.driver.start(&system).await
    }

    /// Status of all systems, or of the system with the given GUID.
    pub async fn status(&self, name: Option<&str>) -> Result<Vec<ServiceStatus>> {
        self.driver.status(name).await
    }

    /// Reclaim every artifact labeled with the given GUID.
    pub async fn delete(&self, guid: &str) -> Result<()> {
        self.driver.delete(guid).await
    }

    /// Patch replicas, resources, or labels on a running system.
    pub async fn modify(&self, modification: Modification) -> Result<()> {
        self.driver.modify(modification).await
    }

    /// Turn a launch request into a parseable spec, going through the
    /// registry when the request names an app rather than an inline compose.
    async fn resolve_request(&self, request: LaunchRequest) -> Result<model::LaunchSpec> {
        let mut spec = model::LaunchSpec {
            name: request.name,
            principal: request.principal,
            compose: serde_yaml::Value::Null,
            service_account: None,
            env: Vec::new(),
            services: Vec::new(),
            resource_request: None,
            app_id: request.app_id.clone(),
            conn_string: request.conn_string.unwrap_or_default(),
            security_context: None,
        };

        if let Some(app_id) = &request.app_id {
            let product = request
                .product
                .as_deref()
                .unwrap_or(&self.config.default_product);
            debug!("resolving app {} under product {}", app_id, product);
            let app = self.registry.launchable(product, app_id)?;
            let entry = self.registry.fetch(app_id, &app).await?;
            spec.compose = entry.spec;
            spec.env = TemplateEngine::parse_env(&entry.env_text);
            for (key, value) in &app.env {
                model::merge_env(&mut spec.env, key, value);
            }
            for (svc, port) in &app.services {
                spec.services
                    .push((svc.clone(), model::ExposureSpec::open(*port)));
            }
            spec.service_account = app.service_account.clone();
            spec.security_context = app.security_context.clone();
            spec.resource_request = app.resource_request.clone();
            if spec.conn_string.is_empty() {
                spec.conn_string = app.conn_string.clone().unwrap_or_default();
            }
        }

        if let Some(compose) = request.system {
            spec.compose = compose;
        }
        if spec.compose.is_null() {
            return Err(TychoError::InvalidCompose(
                "request carries neither a compose document nor an app id".into(),
            ));
        }
        for (key, value) in &request.env {
            model::merge_env(&mut spec.env, key, value);
        }
        for (svc, exposure) in request.services {
            if let Some(existing) = spec.services.iter_mut().find(|(name, _)| *name == svc) {
                existing.1 = exposure;
            } else {
                spec.services.push((svc, exposure));
            }
        }
        if request.resource_request.is_some() {
            spec.resource_request = request.resource_request;
        }

        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_cause() {
        let cause = TychoError::InvalidVolumeSpec("nfs:/x".into());
        let err = TychoError::Start {
            system: "test-abc".into(),
            cause: Box::new(cause),
        };
        assert!(err.to_string().contains("test-abc"));
        let source = std::error::Error::source(&err).expect("cause chain");
        assert!(source.to_string().contains("nfs:/x"));
    }

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
