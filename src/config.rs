use log::{debug, error, info};
use serde_yaml::Value;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, TychoError};

/// How generated service manifests expose ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    NodePort,
    LoadBalancer,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::NodePort => "NodePort",
            ServiceKind::LoadBalancer => "LoadBalancer",
        }
    }

    fn parse(text: &str) -> Result<Self> {
        match text {
            "NodePort" => Ok(ServiceKind::NodePort),
            "LoadBalancer" => Ok(ServiceKind::LoadBalancer),
            other => Err(TychoError::Config(format!(
                "unsupported service type '{other}'"
            ))),
        }
    }
}

/// Deployment phase, selected with the DEV_PHASE environment variable.
/// The test phase skips default volume conventions so fixtures stay
/// self-contained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevPhase {
    Prod,
    Test,
    Stub,
}

impl DevPhase {
    fn parse(text: &str) -> Result<Self> {
        match text {
            "prod" => Ok(DevPhase::Prod),
            "test" => Ok(DevPhase::Test),
            "stub" => Ok(DevPhase::Stub),
            other => Err(TychoError::Config(format!("unknown dev phase '{other}'"))),
        }
    }
}

/// Platform configuration, loaded from `conf/tycho.yaml` and overridden by
/// recognized environment variables. One value of this type is threaded
/// through every component; there is no process-global configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Namespace all namespaced artifacts are applied into
    pub namespace: String,
    /// Product context assumed when a request does not carry one
    pub default_product: String,
    /// Service account attached to pods unless the app overrides it
    pub default_service_account: String,
    /// Fallback IP reported for services without a load-balancer ingress
    pub platform_ip: Option<String>,
    /// NodePort vs LoadBalancer for generated services
    pub service_type: ServiceKind,
    /// User template directories, searched before the built-in templates
    pub template_paths: Vec<PathBuf>,
    /// Location of the app registry document
    pub registry_path: PathBuf,
    /// Name of the pre-provisioned shared NFS claim
    pub stdnfs_pvc: String,
    /// Mount parent for user directories inside containers
    pub parent_dir: String,
    /// Subpath prefix on the shared claim for user directories
    pub subpath_dir: String,
    /// Name of the shared directory convention
    pub shared_dir: String,
    /// Whether default volumes cover user home/shared dirs or everything else
    pub create_home_dirs: bool,
    /// Run containers as root instead of the configured uid/gid
    pub run_as_root: bool,
    pub default_uid: i64,
    pub default_gid: i64,
    /// Templated default volume conventions applied to every container
    pub default_volumes: Vec<String>,
    pub dev_phase: DevPhase,
    /// Deadline for each orchestrator API call
    pub orchestrator_timeout: Duration,
    /// Deadline for registry HTTP fetches
    pub registry_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            default_product: "common".to_string(),
            default_service_account: "default".to_string(),
            platform_ip: Some("192.168.99.111".to_string()),
            service_type: ServiceKind::NodePort,
            template_paths: Vec::new(),
            registry_path: PathBuf::from("conf/app-registry.yaml"),
            stdnfs_pvc: "stdnfs".to_string(),
            parent_dir: "/home".to_string(),
            subpath_dir: "home".to_string(),
            shared_dir: "shared".to_string(),
            create_home_dirs: true,
            run_as_root: false,
            default_uid: 1000,
            default_gid: 1000,
            default_volumes: Vec::new(),
            dev_phase: DevPhase::Prod,
            orchestrator_timeout: Duration::from_secs(30),
            registry_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Load the configuration file, then apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let doc: Value = serde_yaml::from_str(&text)?;
        let mut config = Self::from_document(&doc)?;
        config.apply_env_overrides();
        debug!("loaded config: {:?}", config);
        Ok(config)
    }

    /// Build a configuration from a parsed `tycho.yaml` document.
    pub fn from_document(doc: &Value) -> Result<Self> {
        let defaults = Self::default();
        let root = doc.get("tycho").unwrap_or(doc);

        let kube = lookup(root, &["compute", "platform", "kube"]);
        let platform_ip = kube
            .and_then(|k| k.get("ip"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(defaults.platform_ip);
        let namespace = kube
            .and_then(|k| k.get("namespace"))
            .and_then(Value::as_str)
            .unwrap_or(&defaults.namespace)
            .to_string();
        let service_type = match kube.and_then(|k| k.get("service_type")).and_then(Value::as_str) {
            Some(text) => ServiceKind::parse(text)?,
            None => defaults.service_type,
        };

        let template_paths = lookup(root, &["templates", "paths"])
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();

        let registry = lookup(root, &["registry"]);
        let registry_path = registry
            .and_then(|r| r.get("path"))
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or(defaults.registry_path);
        let default_product = registry
            .and_then(|r| r.get("default_product"))
            .and_then(Value::as_str)
            .unwrap_or(&defaults.default_product)
            .to_string();

        let nfs = lookup(root, &["nfs"]);
        let pick = |key: &str, fallback: &str| -> String {
            nfs.and_then(|n| n.get(key))
                .and_then(Value::as_str)
                .unwrap_or(fallback)
                .to_string()
        };
        let stdnfs_pvc = pick("stdnfs_pvc", &defaults.stdnfs_pvc);
        let parent_dir = pick("parent_dir", &defaults.parent_dir);
        let subpath_dir = pick("subpath_dir", &defaults.subpath_dir);
        let shared_dir = pick("shared_dir", &defaults.shared_dir);

        let default_volumes = lookup(root, &["volumes", "defaults"])
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let security = lookup(root, &["security"]);
        let default_uid = security
            .and_then(|s| s.get("uid"))
            .and_then(Value::as_i64)
            .unwrap_or(defaults.default_uid);
        let default_gid = security
            .and_then(|s| s.get("gid"))
            .and_then(Value::as_i64)
            .unwrap_or(defaults.default_gid);

        let default_service_account = root
            .get("service_account")
            .and_then(Value::as_str)
            .unwrap_or(&defaults.default_service_account)
            .to_string();

        let timeouts = lookup(root, &["timeouts"]);
        let orchestrator_timeout = timeouts
            .and_then(|t| t.get("orchestrator_seconds"))
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(defaults.orchestrator_timeout);
        let registry_timeout = timeouts
            .and_then(|t| t.get("registry_seconds"))
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(defaults.registry_timeout);

        Ok(Self {
            namespace,
            default_product,
            default_service_account,
            platform_ip,
            service_type,
            template_paths,
            registry_path,
            stdnfs_pvc,
            parent_dir,
            subpath_dir,
            shared_dir,
            create_home_dirs: defaults.create_home_dirs,
            run_as_root: defaults.run_as_root,
            default_uid,
            default_gid,
            default_volumes,
            dev_phase: defaults.dev_phase,
            orchestrator_timeout,
            registry_timeout,
        })
    }

    /// Overlay recognized environment variables onto the file-based values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(ns) = std::env::var("NAMESPACE") {
            self.namespace = ns;
        }
        if let Ok(pvc) = std::env::var("STDNFS_PVC") {
            self.stdnfs_pvc = pvc;
        }
        if let Ok(dir) = std::env::var("PARENT_DIR") {
            self.parent_dir = dir;
        }
        if let Ok(dir) = std::env::var("SUBPATH_DIR") {
            self.subpath_dir = dir;
        }
        if let Ok(dir) = std::env::var("SHARED_DIR") {
            self.shared_dir = dir;
        }
        if let Ok(flag) = std::env::var("CREATE_HOME_DIRS") {
            self.create_home_dirs = flag.eq_ignore_ascii_case("true");
        }
        if let Ok(flag) = std::env::var("RUNASROOT") {
            self.run_as_root = flag.eq_ignore_ascii_case("true");
        }
        if let Ok(phase) = std::env::var("DEV_PHASE") {
            match DevPhase::parse(&phase) {
                Ok(parsed) => self.dev_phase = parsed,
                Err(e) => error!("ignoring DEV_PHASE: {e}"),
            }
        }
        if std::env::var("TYCHO_ON_MINIKUBE").is_ok() {
            if let Some(ip) = minikube_ip() {
                info!("configuring minikube ip: {ip}");
                self.platform_ip = Some(ip);
            } else {
                error!("unable to get minikube ip address");
            }
        }
    }
}

/// Discover the platform IP by asking the minikube CLI. Returns None when
/// the command fails or prints something that is not an address.
fn minikube_ip() -> Option<String> {
    let output = std::process::Command::new("minikube")
        .arg("ip")
        .output()
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    text.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

fn lookup<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for key in path {
        current = current.get(key)?;
    }
    Some(current)
}
