use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::config::{DevPhase, EngineConfig};
use crate::template::TemplateEngine;
use crate::{Result, TychoError};

/// Compose service keys the parser understands. Anything else is rejected
/// rather than silently dropped.
const KNOWN_SERVICE_KEYS: &[&str] = &[
    "image",
    "entrypoint",
    "environment",
    "ports",
    "expose",
    "depends_on",
    "volumes",
    "deploy",
    "user",
    "security_context",
];

/// The identity a system runs on behalf of.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Principal {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl Principal {
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            access_token: None,
            refresh_token: None,
        }
    }
}

/// Compute resources for one container: cpus, gpus, memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ResourceSpec {
    pub fn is_empty(&self) -> bool {
        self.cpus.is_none() && self.gpus.is_none() && self.memory.is_none()
    }

    /// Overlay set fields of `other` onto self.
    pub fn merge_over(&mut self, other: &ResourceSpec) {
        if other.cpus.is_some() {
            self.cpus = other.cpus.clone();
        }
        if other.gpus.is_some() {
            self.gpus = other.gpus.clone();
        }
        if other.memory.is_some() {
            self.memory = other.memory.clone();
        }
    }
}

/// Pod/container security posture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_group: Option<i64>,
}

/// One environment entry. Declaration order is significant and preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Invocation of an image in a specific infrastructural context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<EnvVar>,
    pub identity: Option<i64>,
    pub limits: ResourceSpec,
    pub requests: ResourceSpec,
    pub ports: Vec<u16>,
    pub expose: Vec<u16>,
    pub depends_on: Vec<String>,
    /// Raw `pvc://` references as declared
    pub volumes: Vec<String>,
    pub security_context: Option<SecurityContext>,
}

/// A derived volume record. Exactly one record per raw reference; only the
/// first record for each distinct volume name carries a `pvc_name`, so one
/// PVC manifest is emitted per unique volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub container_name: String,
    pub pvc_name: Option<String>,
    pub volume_name: String,
    pub path: String,
    pub subpath: String,
}

/// A declared network entry-point onto a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceExposure {
    pub port: u16,
    /// Ingress CIDR allow-list; empty means open
    pub clients: Vec<String>,
    /// `<svc>-<identifier>`
    pub name: String,
    /// The original compose key
    pub name_noid: String,
}

/// A named, GUID-identified deployment unit of one or more containers and
/// their exposures. Immutable after parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct System {
    pub system_name: String,
    /// Fresh 128-bit GUID, hex-rendered
    pub identifier: String,
    /// `{system_name}-{identifier}`, DNS-label-safe
    pub name: String,
    pub namespace: String,
    pub principal: Principal,
    pub service_account: String,
    pub containers: Vec<Container>,
    pub services: Vec<ServiceExposure>,
    pub volumes: Vec<Volume>,
    /// The compiled source, retained for audit
    pub source_text: String,
    pub annotations: Vec<(String, String)>,
    pub conn_string: String,
    pub app_id: Option<String>,
    pub security_context: Option<SecurityContext>,
}

impl System {
    /// Exposure for a container, if one was declared.
    pub fn exposure_for(&self, container: &str) -> Option<&ServiceExposure> {
        self.services.iter().find(|s| s.name_noid == container)
    }
}

/// Address of one launched service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAddress {
    pub name: String,
    pub ip_address: Option<String>,
    pub port: Option<i32>,
}

/// Outcome of a successful start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchResult {
    pub name: String,
    pub sid: String,
    pub services: Vec<ServiceAddress>,
    pub conn_string: String,
    pub status: String,
}

/// One row of `status` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub sid: Option<String>,
    pub ip_address: Option<String>,
    pub port: Option<String>,
    pub creation_time: Option<String>,
    pub app_id: Option<String>,
}

/// Requested exposure for one service: port plus optional client CIDRs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExposureSpec {
    pub port: u16,
    #[serde(default)]
    pub clients: Vec<String>,
}

impl ExposureSpec {
    pub fn open(port: u16) -> Self {
        Self {
            port,
            clients: Vec::new(),
        }
    }
}

/// A caller-facing launch request: either an inline compose document or an
/// app id to be resolved through the registry.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub name: String,
    pub principal: Principal,
    pub system: Option<Value>,
    pub env: Vec<(String, String)>,
    pub services: Vec<(String, ExposureSpec)>,
    pub resource_request: Option<ResourceSpec>,
    pub app_id: Option<String>,
    pub product: Option<String>,
    pub conn_string: Option<String>,
}

impl LaunchRequest {
    pub fn inline(name: &str, principal: Principal, compose: Value) -> Self {
        Self {
            name: name.to_string(),
            principal,
            system: Some(compose),
            env: Vec::new(),
            services: Vec::new(),
            resource_request: None,
            app_id: None,
            product: None,
            conn_string: None,
        }
    }
}

/// Fully-resolved input to the parser: compose document plus every setting
/// the registry or the caller contributed.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub principal: Principal,
    pub compose: Value,
    pub service_account: Option<String>,
    pub env: Vec<(String, String)>,
    pub services: Vec<(String, ExposureSpec)>,
    pub resource_request: Option<ResourceSpec>,
    pub app_id: Option<String>,
    pub conn_string: String,
    pub security_context: Option<SecurityContext>,
}

/// Append or overwrite a key in an ordered env list, keeping the position
/// of an existing key.
pub fn merge_env(env: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(existing) = env.iter_mut().find(|(k, _)| k == key) {
        existing.1 = value.to_string();
    } else {
        env.push((key.to_string(), value.to_string()));
    }
}

/// Parses Compose-style specifications into the abstract system model.
pub struct SystemParser;

impl Default for SystemParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemParser {
    pub fn new() -> Self {
        Self
    }

    /// Compile a launch spec into a `System`.
    pub fn parse(&self, config: &EngineConfig, spec: LaunchSpec) -> Result<System> {
        let identifier = generate_identifier();
        let system_name = sanitize_name(&spec.name);
        let name = format!("{system_name}-{identifier}");

        let source_text = serde_yaml::to_string(&spec.compose)?;
        let compose: Value = if spec.env.is_empty() {
            spec.compose.clone()
        } else {
            let env_map: HashMap<String, String> = spec.env.iter().cloned().collect();
            let substituted = TemplateEngine::safe_substitute(&source_text, &env_map);
            serde_yaml::from_str(&substituted)
                .map_err(|e| TychoError::InvalidCompose(format!("after substitution: {e}")))?
        };

        let services_section = compose
            .get("services")
            .and_then(Value::as_mapping)
            .ok_or_else(|| TychoError::InvalidCompose("no services section".to_string()))?;
        if services_section.is_empty() {
            return Err(TychoError::InvalidCompose(
                "services section is empty".to_string(),
            ));
        }

        // Settings injected into every container, after its own environment.
        // The $STDNFS token resolves to the configured shared claim.
        let settings: Vec<(String, String)> = spec
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.replace("$STDNFS", &config.stdnfs_pvc)))
            .collect();

        let mut containers = Vec::new();
        for (key, service) in services_section {
            let cname = key
                .as_str()
                .ok_or_else(|| TychoError::InvalidCompose("non-string service name".to_string()))?;
            let container = self.parse_service(config, &spec, cname, service, &settings)?;
            containers.push(container);
        }

        let volumes = derive_volumes(&containers)?;

        for (svc, _) in &spec.services {
            if !containers.iter().any(|c| &c.name == svc) {
                return Err(TychoError::UnknownService(svc.clone()));
            }
        }
        // Exposures follow the compose document's container order so that
        // generated manifests are reproducible.
        let mut services = Vec::new();
        for container in &containers {
            if let Some((_, exposure)) = spec.services.iter().find(|(n, _)| n == &container.name) {
                services.push(ServiceExposure {
                    port: exposure.port,
                    clients: exposure.clients.clone(),
                    name: format!("{}-{}", container.name, identifier),
                    name_noid: container.name.clone(),
                });
            }
        }

        let security_context = spec.security_context.clone().or_else(|| {
            Some(if config.run_as_root {
                SecurityContext {
                    run_as_user: Some(0),
                    fs_group: Some(0),
                }
            } else {
                SecurityContext {
                    run_as_user: Some(config.default_uid),
                    fs_group: Some(config.default_gid),
                }
            })
        });

        let system = System {
            system_name,
            identifier,
            name,
            namespace: config.namespace.clone(),
            principal: spec.principal,
            service_account: spec
                .service_account
                .unwrap_or_else(|| config.default_service_account.clone()),
            containers,
            services,
            volumes,
            source_text,
            annotations: Vec::new(),
            conn_string: spec.conn_string,
            app_id: spec.app_id,
            security_context,
        };
        debug!(
            "parsed system {} with {} containers, {} volumes, {} exposures",
            system.name,
            system.containers.len(),
            system.volumes.len(),
            system.services.len()
        );
        Ok(system)
    }

    fn parse_service(
        &self,
        config: &EngineConfig,
        spec: &LaunchSpec,
        cname: &str,
        service: &Value,
        settings: &[(String, String)],
    ) -> Result<Container> {
        let body = service.as_mapping().ok_or_else(|| {
            TychoError::InvalidCompose(format!("service '{cname}' has no definition"))
        })?;
        for key in body.keys() {
            let key = key.as_str().unwrap_or_default();
            if !KNOWN_SERVICE_KEYS.contains(&key) {
                return Err(TychoError::InvalidCompose(format!(
                    "service '{cname}' has unsupported field '{key}'"
                )));
            }
        }

        let image = service
            .get("image")
            .and_then(Value::as_str)
            .ok_or_else(|| TychoError::InvalidCompose(format!("service '{cname}' has no image")))?
            .to_string();

        let command = parse_entrypoint(service);
        let mut env = parse_environment(cname, service)?;
        for (key, value) in settings {
            if let Some(existing) = env.iter_mut().find(|e| &e.name == key) {
                existing.value = value.clone();
            } else {
                env.push(EnvVar {
                    name: key.clone(),
                    value: value.clone(),
                });
            }
        }

        let ports = parse_port_list(cname, service.get("ports"))?;
        let expose = parse_port_list(cname, service.get("expose"))?;

        let depends_on = service
            .get("depends_on")
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let identity = match service.get("user") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse::<i64>().ok(),
            _ => None,
        };

        let (mut limits, mut requests) = parse_resources(service);
        if let Some(request) = &spec.resource_request {
            requests.merge_over(request);
            if limits.is_empty() {
                limits.merge_over(request);
            }
        }

        let security_context = match service.get("security_context") {
            Some(value) => Some(
                serde_yaml::from_value(value.clone()).map_err(|e| {
                    TychoError::InvalidCompose(format!(
                        "service '{cname}' security_context: {e}"
                    ))
                })?,
            ),
            None => None,
        };

        let mut volumes: Vec<String> = service
            .get("volumes")
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        volumes.extend(default_volumes(config, &spec.principal.username));

        Ok(Container {
            name: cname.to_string(),
            image,
            command,
            env,
            identity,
            limits,
            requests,
            ports,
            expose,
            depends_on,
            volumes,
            security_context,
        })
    }
}

/// Fresh 128-bit GUID rendered as 32 lowercase hex characters.
pub fn generate_identifier() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Reduce a caller-supplied name to a DNS-label-safe form.
pub fn sanitize_name(name: &str) -> String {
    let pattern = Regex::new(r"[^a-z0-9-]+").expect("name pattern");
    pattern
        .replace_all(&name.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

/// Default volume conventions for this deployment, expanded for the user.
///
/// With CREATE_HOME_DIRS set, only the conventions that mention the user
/// home or shared dir survive; unset, those are the ones dropped. The test
/// phase skips defaults entirely.
fn default_volumes(config: &EngineConfig, username: &str) -> Vec<String> {
    if config.dev_phase == DevPhase::Test {
        return Vec::new();
    }
    let variables: HashMap<String, String> = [
        ("stdnfs_pvc", config.stdnfs_pvc.as_str()),
        ("username", username),
        ("parent_dir", config.parent_dir.as_str()),
        ("subpath_dir", config.subpath_dir.as_str()),
        ("shared_dir", config.shared_dir.as_str()),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    config
        .default_volumes
        .iter()
        .filter(|template| {
            let mentions_home =
                template.contains("${username}") || template.contains("${shared_dir}");
            mentions_home == config.create_home_dirs
        })
        .map(|template| TemplateEngine::safe_substitute(template, &variables))
        .collect()
}

fn parse_entrypoint(service: &Value) -> Vec<String> {
    match service.get("entrypoint") {
        Some(Value::String(line)) => line.split_whitespace().map(str::to_string).collect(),
        Some(Value::Sequence(parts)) => parts
            .iter()
            .map(scalar_to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_environment(cname: &str, service: &Value) -> Result<Vec<EnvVar>> {
    let mut env = Vec::new();
    match service.get("environment") {
        Some(Value::Sequence(entries)) => {
            for entry in entries {
                let line = entry.as_str().ok_or_else(|| {
                    TychoError::InvalidCompose(format!(
                        "service '{cname}' has a non-string environment entry"
                    ))
                })?;
                let (name, value) = line.split_once('=').unwrap_or((line, ""));
                env.push(EnvVar {
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Some(Value::Mapping(entries)) => {
            for (key, value) in entries {
                let name = key.as_str().ok_or_else(|| {
                    TychoError::InvalidCompose(format!(
                        "service '{cname}' has a non-string environment key"
                    ))
                })?;
                env.push(EnvVar {
                    name: name.to_string(),
                    value: scalar_to_string(value),
                });
            }
        }
        Some(_) => {
            return Err(TychoError::InvalidCompose(format!(
                "service '{cname}' environment must be a list or mapping"
            )));
        }
        None => {}
    }
    Ok(env)
}

/// Reduce compose port declarations to container ports. A `host:container`
/// pair keeps only the container side; allocation of an external port is
/// the orchestrator's business.
fn parse_port_list(cname: &str, ports: Option<&Value>) -> Result<Vec<u16>> {
    let mut result = Vec::new();
    let Some(seq) = ports.and_then(Value::as_sequence) else {
        return Ok(result);
    };
    for entry in seq {
        let port = match entry {
            Value::Number(n) => n
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| bad_port(cname, &scalar_to_string(entry)))?,
            Value::String(text) => {
                let container_side = text.rsplit_once(':').map(|(_, c)| c).unwrap_or(text);
                container_side
                    .parse::<u16>()
                    .map_err(|_| bad_port(cname, text))?
            }
            other => return Err(bad_port(cname, &scalar_to_string(other))),
        };
        result.push(port);
    }
    Ok(result)
}

fn bad_port(cname: &str, entry: &str) -> TychoError {
    TychoError::InvalidCompose(format!("service '{cname}' has a bad port '{entry}'"))
}

fn parse_resources(service: &Value) -> (ResourceSpec, ResourceSpec) {
    let resources = service
        .get("deploy")
        .and_then(|d| d.get("resources"));
    let pick = |section: &str| -> ResourceSpec {
        resources
            .and_then(|r| r.get(section))
            .map(|v| ResourceSpec {
                cpus: v.get("cpus").map(scalar_to_string),
                gpus: v.get("gpus").map(scalar_to_string),
                memory: v.get("memory").map(scalar_to_string),
            })
            .unwrap_or_default()
    };
    (pick("limits"), pick("reservations"))
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
    }
}

/// Flatten every raw volume reference into derived records, assigning the
/// claim to the first occurrence of each volume name only.
pub fn derive_volumes(containers: &[Container]) -> Result<Vec<Volume>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut volumes = Vec::new();
    for container in containers {
        for raw in &container.volumes {
            let rest = raw.strip_prefix("pvc://").ok_or_else(|| {
                TychoError::InvalidVolumeSpec(format!("'{raw}' does not use the pvc:// scheme"))
            })?;
            let (source, path) = rest.split_once(':').ok_or_else(|| {
                TychoError::InvalidVolumeSpec(format!("'{raw}' has no container mount path"))
            })?;
            if source.is_empty() || path.is_empty() {
                return Err(TychoError::InvalidVolumeSpec(format!(
                    "'{raw}' is missing a volume name or mount path"
                )));
            }
            let (volume_name, subpath) = match source.split_once('/') {
                Some((name, sub)) => (name.to_string(), sub.to_string()),
                None => (source.to_string(), String::new()),
            };
            let pvc_name = if seen.insert(volume_name.clone()) {
                Some(volume_name.clone())
            } else {
                None
            };
            volumes.push(Volume {
                container_name: container.name.clone(),
                pvc_name,
                volume_name,
                path: path.to_string(),
                subpath,
            });
        }
    }
    Ok(volumes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EngineConfig {
        EngineConfig {
            dev_phase: DevPhase::Test,
            ..EngineConfig::default()
        }
    }

    fn jupyter_compose() -> Value {
        serde_yaml::from_str(
            r#"
version: "3"
services:
  jupyter-datascience:
    image: jupyter/datascience-notebook
    entrypoint: start.sh jupyter lab
    ports:
      - 8888
    deploy:
      resources:
        limits:
          cpus: "0.01"
          memory: 50M
        reservations:
          cpus: "0.01"
          memory: 20M
    volumes:
      - "pvc://cloud-top/projects:/work/data"
"#,
        )
        .unwrap()
    }

    fn launch_spec(compose: Value) -> LaunchSpec {
        LaunchSpec {
            name: "test".to_string(),
            principal: Principal::new("renci"),
            compose,
            service_account: None,
            env: Vec::new(),
            services: Vec::new(),
            resource_request: None,
            app_id: None,
            conn_string: String::new(),
            security_context: None,
        }
    }

    #[test]
    fn test_system_parser() {
        let system = SystemParser::new()
            .parse(&test_config(), launch_spec(jupyter_compose()))
            .unwrap();

        assert!(system.name.starts_with("test-"));
        assert_eq!(system.containers.len(), 1);
        let container = &system.containers[0];
        assert_eq!(container.name, "jupyter-datascience");
        assert_eq!(container.image, "jupyter/datascience-notebook");
        assert_eq!(container.command, vec!["start.sh", "jupyter", "lab"]);
        assert_eq!(container.limits.cpus.as_deref(), Some("0.01"));
        assert_eq!(container.limits.memory.as_deref(), Some("50M"));
        assert_eq!(container.requests.cpus.as_deref(), Some("0.01"));
        assert_eq!(container.requests.memory.as_deref(), Some("20M"));
        assert_eq!(container.ports, vec![8888]);
        assert_eq!(container.volumes[0], "pvc://cloud-top/projects:/work/data");
        assert_eq!(system.volumes[0].volume_name, "cloud-top");
        assert_eq!(system.volumes[0].subpath, "projects");
        assert_eq!(system.volumes[0].path, "/work/data");
    }

    #[test]
    fn test_identifier_appended_to_name() {
        let system = SystemParser::new()
            .parse(&test_config(), launch_spec(jupyter_compose()))
            .unwrap();
        assert_eq!(system.name, format!("test-{}", system.identifier));
        assert_eq!(system.identifier.len(), 32);
    }

    #[test]
    fn test_exposures_wired_to_containers() {
        let mut spec = launch_spec(jupyter_compose());
        spec.services = vec![(
            "jupyter-datascience".to_string(),
            ExposureSpec {
                port: 8888,
                clients: vec!["127.0.0.1".to_string()],
            },
        )];
        let system = SystemParser::new().parse(&test_config(), spec).unwrap();
        assert_eq!(system.services.len(), 1);
        let exposure = &system.services[0];
        assert_eq!(exposure.port, 8888);
        assert_eq!(exposure.name_noid, "jupyter-datascience");
        assert_eq!(
            exposure.name,
            format!("jupyter-datascience-{}", system.identifier)
        );
    }

    #[test]
    fn test_unknown_service_rejected_before_any_manifest() {
        let mut spec = launch_spec(jupyter_compose());
        spec.services = vec![("no-such-container".to_string(), ExposureSpec::open(80))];
        let err = SystemParser::new()
            .parse(&test_config(), spec)
            .unwrap_err();
        assert!(matches!(err, TychoError::UnknownService(_)));
    }

    #[test]
    fn test_missing_image_rejected() {
        let compose: Value = serde_yaml::from_str(
            r#"
services:
  broken:
    ports:
      - 80
"#,
        )
        .unwrap();
        let err = SystemParser::new()
            .parse(&test_config(), launch_spec(compose))
            .unwrap_err();
        assert!(matches!(err, TychoError::InvalidCompose(_)));
    }

    #[test]
    fn test_unsupported_field_rejected() {
        let compose: Value = serde_yaml::from_str(
            r#"
services:
  web:
    image: nginx:1.20
    healthcheck:
      test: curl localhost
"#,
        )
        .unwrap();
        let err = SystemParser::new()
            .parse(&test_config(), launch_spec(compose))
            .unwrap_err();
        assert!(matches!(err, TychoError::InvalidCompose(_)));
    }

    #[test]
    fn test_bad_port_rejected() {
        let compose: Value = serde_yaml::from_str(
            r#"
services:
  web:
    image: nginx:1.20
    ports:
      - "eighty"
"#,
        )
        .unwrap();
        let err = SystemParser::new()
            .parse(&test_config(), launch_spec(compose))
            .unwrap_err();
        assert!(matches!(err, TychoError::InvalidCompose(_)));
    }

    #[test]
    fn test_host_port_reduced_to_container_port() {
        let compose: Value = serde_yaml::from_str(
            r#"
services:
  web:
    image: nginx:1.20
    ports:
      - "80:8080"
"#,
        )
        .unwrap();
        let system = SystemParser::new()
            .parse(&test_config(), launch_spec(compose))
            .unwrap();
        assert_eq!(system.containers[0].ports, vec![8080]);
    }

    #[test]
    fn test_environment_order_and_settings_merge() {
        let compose: Value = serde_yaml::from_str(
            r#"
services:
  web:
    image: nginx:1.20
    environment:
      - A=1
      - B=2
"#,
        )
        .unwrap();
        let mut spec = launch_spec(compose);
        spec.env = vec![
            ("B".to_string(), "override".to_string()),
            ("NFS".to_string(), "$STDNFS/data".to_string()),
        ];
        let system = SystemParser::new().parse(&test_config(), spec).unwrap();
        let env = &system.containers[0].env;
        assert_eq!(env[0], EnvVar { name: "A".into(), value: "1".into() });
        assert_eq!(env[1], EnvVar { name: "B".into(), value: "override".into() });
        assert_eq!(env[2].name, "NFS");
        assert_eq!(env[2].value, "stdnfs/data");
    }

    #[test]
    fn test_env_substitution_into_compose() {
        let compose: Value = serde_yaml::from_str(
            r#"
services:
  web:
    image: "nginx:$NGINX_VERSION"
"#,
        )
        .unwrap();
        let mut spec = launch_spec(compose);
        spec.env = vec![("NGINX_VERSION".to_string(), "1.20".to_string())];
        let system = SystemParser::new().parse(&test_config(), spec).unwrap();
        assert_eq!(system.containers[0].image, "nginx:1.20");
    }

    #[test]
    fn test_volume_derivation() {
        let containers = vec![Container {
            name: "nginx".to_string(),
            image: "sample/image:v1".to_string(),
            command: vec![],
            env: vec![],
            identity: None,
            limits: ResourceSpec::default(),
            requests: ResourceSpec::default(),
            ports: vec![],
            expose: vec![],
            depends_on: vec![],
            volumes: vec![
                "pvc://nfsrods/rods:/home/rods".to_string(),
                "pvc://cloud-top:/home/shared".to_string(),
            ],
            security_context: None,
        }];
        let volumes = derive_volumes(&containers).unwrap();
        assert_eq!(volumes[0].container_name, "nginx");
        assert_eq!(volumes[0].pvc_name.as_deref(), Some("nfsrods"));
        assert_eq!(volumes[0].volume_name, "nfsrods");
        assert_eq!(volumes[0].path, "/home/rods");
        assert_eq!(volumes[0].subpath, "rods");
        assert_eq!(volumes[1].pvc_name.as_deref(), Some("cloud-top"));
        assert_eq!(volumes[1].subpath, "");
    }

    #[test]
    fn test_duplicate_volume_claims_once() {
        let make = |name: &str, volumes: Vec<&str>| Container {
            name: name.to_string(),
            image: "sample/image:v1".to_string(),
            command: vec![],
            env: vec![],
            identity: None,
            limits: ResourceSpec::default(),
            requests: ResourceSpec::default(),
            ports: vec![],
            expose: vec![],
            depends_on: vec![],
            volumes: volumes.into_iter().map(str::to_string).collect(),
            security_context: None,
        };
        let containers = vec![
            make("a", vec!["pvc://nfsrods/rods:/home/rods"]),
            make("b", vec!["pvc://nfsrods/alice:/home/alice"]),
        ];
        let volumes = derive_volumes(&containers).unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0].pvc_name.as_deref(), Some("nfsrods"));
        assert_eq!(volumes[1].pvc_name, None);
        let claims: Vec<_> = volumes.iter().filter_map(|v| v.pvc_name.as_ref()).collect();
        assert_eq!(claims.len(), 1);
    }

    #[test]
    fn test_bad_volume_scheme_rejected() {
        let containers = vec![Container {
            name: "a".to_string(),
            image: "img".to_string(),
            command: vec![],
            env: vec![],
            identity: None,
            limits: ResourceSpec::default(),
            requests: ResourceSpec::default(),
            ports: vec![],
            expose: vec![],
            depends_on: vec![],
            volumes: vec!["nfs://share:/mnt".to_string()],
            security_context: None,
        }];
        let err = derive_volumes(&containers).unwrap_err();
        assert!(matches!(err, TychoError::InvalidVolumeSpec(_)));
    }

    #[test]
    fn test_default_volumes_follow_home_dir_policy() {
        let mut config = EngineConfig {
            dev_phase: DevPhase::Prod,
            default_volumes: vec![
                "pvc://${stdnfs_pvc}/${subpath_dir}/${username}:${parent_dir}/${username}"
                    .to_string(),
                "pvc://${stdnfs_pvc}/data:/data".to_string(),
            ],
            ..EngineConfig::default()
        };

        config.create_home_dirs = true;
        let homes = default_volumes(&config, "renci");
        assert_eq!(homes, vec!["pvc://stdnfs/home/renci:/home/renci".to_string()]);

        config.create_home_dirs = false;
        let others = default_volumes(&config, "renci");
        assert_eq!(others, vec!["pvc://stdnfs/data:/data".to_string()]);

        config.dev_phase = DevPhase::Test;
        assert!(default_volumes(&config, "renci").is_empty());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("My App/Dir"), "my-app-dir");
        assert_eq!(sanitize_name("plain"), "plain");
    }

    #[test]
    fn test_identifiers_do_not_collide() {
        let mut seen = HashSet::new();
        for _ in 0..100_000 {
            assert!(seen.insert(generate_identifier()));
        }
    }

    #[test]
    fn test_source_round_trip() {
        let config = test_config();
        let system = SystemParser::new()
            .parse(&config, launch_spec(jupyter_compose()))
            .unwrap();
        let reparsed_compose: Value = serde_yaml::from_str(&system.source_text).unwrap();
        let reparsed = SystemParser::new()
            .parse(&config, launch_spec(reparsed_compose))
            .unwrap();
        assert_eq!(
            system.containers[0].image,
            reparsed.containers[0].image
        );
        assert_eq!(system.containers[0].ports, reparsed.containers[0].ports);
        assert_eq!(system.volumes, reparsed.volumes);
        assert_ne!(system.identifier, reparsed.identifier);
    }
}
