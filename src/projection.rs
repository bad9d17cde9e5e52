use log::debug;
use serde_json::{json, Map, Value as JsonValue};
use serde_yaml::Value;
use std::collections::HashSet;

use crate::config::EngineConfig;
use crate::model::{Container, ResourceSpec, System, Volume};
use crate::template::TemplateEngine;
use crate::{Result, TychoError};

/// Claim names assumed pre-provisioned; no PVC/PV manifest is generated
/// for them.
const SHARED_CLAIMS: &[&str] = &["nfs", "stdnfs"];

/// The concrete orchestrator artifacts for one system, in apply order.
#[derive(Debug, Clone)]
pub struct ManifestSet {
    pub pvcs: Vec<Value>,
    pub pvs: Vec<Value>,
    pub deployment: Value,
    pub network_policy: Option<Value>,
    pub services: Vec<Value>,
}

impl ManifestSet {
    /// Every document in the set, in apply order.
    pub fn all(&self) -> Vec<&Value> {
        let mut documents: Vec<&Value> = Vec::new();
        documents.extend(self.pvcs.iter());
        documents.extend(self.pvs.iter());
        documents.push(&self.deployment);
        if let Some(policy) = &self.network_policy {
            documents.push(policy);
        }
        documents.extend(self.services.iter());
        documents
    }
}

/// Turns a `System` into the manifest set that realizes it.
///
/// Generation is deterministic: containers, volumes, and services are
/// iterated in the declaration order the parser preserved.
pub struct Projection {
    engine: TemplateEngine,
    service_type: &'static str,
    shared_claims: HashSet<String>,
}

impl Projection {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let engine = TemplateEngine::new(config.template_paths.clone(), BUILTIN_TEMPLATES)?;
        let mut shared_claims: HashSet<String> =
            SHARED_CLAIMS.iter().map(|s| s.to_string()).collect();
        shared_claims.insert(config.stdnfs_pvc.clone());
        Ok(Self {
            engine,
            service_type: config.service_type.as_str(),
            shared_claims,
        })
    }

    /// Generate the full manifest set for a system.
    pub fn project(&self, system: &System) -> Result<ManifestSet> {
        let labels = self.labels(system);

        let claims: Vec<&Volume> = system
            .volumes
            .iter()
            .filter(|v| v.pvc_name.is_some() && !self.shared_claims.contains(&v.volume_name))
            .collect();
        let claim_context = json!({
            "labels": labels,
            "claims": claims.iter().map(|v| json!({
                "name": v.pvc_name,
                "volume_name": v.volume_name,
            })).collect::<Vec<_>>(),
        });

        let pvcs = if claims.is_empty() {
            Vec::new()
        } else {
            self.engine.render("pvc.yaml", &claim_context)?
        };
        let pvs = if claims.is_empty() {
            Vec::new()
        } else {
            self.engine.render("pv.yaml", &claim_context)?
        };

        let deployment = single_document(
            "deployment.yaml",
            self.engine
                .render("deployment.yaml", &self.deployment_context(system, &labels))?,
        )?;

        let network_policy = if system.services.iter().any(|s| !s.clients.is_empty()) {
            let rules: Vec<JsonValue> = system
                .services
                .iter()
                .flat_map(|exposure| {
                    exposure.clients.iter().map(move |cidr| {
                        json!({
                            "cidr": normalize_cidr(cidr),
                            "port": exposure.port,
                        })
                    })
                })
                .collect();
            let context = json!({
                "name": system.name,
                "namespace": system.namespace,
                "identifier": system.identifier,
                "labels": labels,
                "rules": rules,
            });
            Some(single_document(
                "netpolicy.yaml",
                self.engine.render("netpolicy.yaml", &context)?,
            )?)
        } else {
            None
        };

        let services = if system.services.is_empty() {
            Vec::new()
        } else {
            let context = json!({
                "name": system.name,
                "labels": labels,
                "service_type": self.service_type,
                "exposures": system.services,
            });
            self.engine.render("service.yaml", &context)?
        };

        debug!(
            "projected {}: {} pvcs, {} pvs, {} services, netpolicy: {}",
            system.name,
            pvcs.len(),
            pvs.len(),
            services.len(),
            network_policy.is_some()
        );
        Ok(ManifestSet {
            pvcs,
            pvs,
            deployment,
            network_policy,
            services,
        })
    }

    /// Labels attached to every generated artifact.
    fn labels(&self, system: &System) -> JsonValue {
        let mut labels = Map::new();
        labels.insert("executor".to_string(), json!("tycho"));
        labels.insert("name".to_string(), json!(system.name));
        labels.insert("tycho-guid".to_string(), json!(system.identifier));
        labels.insert("username".to_string(), json!(system.principal.username));
        if let Some(app_id) = &system.app_id {
            labels.insert("app_id".to_string(), json!(app_id));
        }
        JsonValue::Object(labels)
    }

    fn deployment_context(&self, system: &System, labels: &JsonValue) -> JsonValue {
        // One pod volume per unique volume name, mounted per derived record.
        let mut seen = HashSet::new();
        let pod_volumes: Vec<JsonValue> = system
            .volumes
            .iter()
            .filter(|v| seen.insert(v.volume_name.clone()))
            .map(|v| {
                json!({
                    "name": v.volume_name,
                    "claim": v.volume_name,
                })
            })
            .collect();

        let containers: Vec<JsonValue> = system
            .containers
            .iter()
            .map(|c| self.container_context(system, c))
            .collect();

        let annotations: Map<String, JsonValue> = system
            .annotations
            .iter()
            .map(|(key, value)| (key.clone(), json!(value)))
            .collect();

        json!({
            "name": system.name,
            "namespace": system.namespace,
            "labels": labels,
            "annotations": annotations,
            "service_account": system.service_account,
            "security_context": security_context(
                system.security_context.as_ref().and_then(|sc| sc.run_as_user),
                system.security_context.as_ref().and_then(|sc| sc.fs_group),
            ),
            "containers": containers,
            "pod_volumes": pod_volumes,
        })
    }

    fn container_context(&self, system: &System, container: &Container) -> JsonValue {
        let mounts: Vec<JsonValue> = system
            .volumes
            .iter()
            .filter(|v| v.container_name == container.name)
            .map(|v| {
                json!({
                    "name": v.volume_name,
                    "path": v.path,
                    "subpath": if v.subpath.is_empty() { JsonValue::Null } else { json!(v.subpath) },
                })
            })
            .collect();

        let mut ports: Vec<u16> = container.ports.clone();
        ports.extend(container.expose.iter().copied());

        // fsGroup is pod-scoped; only runAsUser belongs on the container.
        let run_as_user = container
            .security_context
            .as_ref()
            .and_then(|sc| sc.run_as_user)
            .or(container.identity);

        json!({
            "name": container.name,
            "image": container.image,
            "command": container.command,
            "env": container.env,
            "ports": ports,
            "resources": resources_context(&container.limits, &container.requests),
            "security_context": security_context(run_as_user, None),
            "mounts": mounts,
        })
    }
}

/// Security context as ready-to-emit manifest keys. Collapses to null when
/// nothing is set; zero is a meaningful uid and must survive.
fn security_context(run_as_user: Option<i64>, fs_group: Option<i64>) -> JsonValue {
    let mut entries = Map::new();
    if let Some(uid) = run_as_user {
        entries.insert("runAsUser".to_string(), json!(uid));
    }
    if let Some(gid) = fs_group {
        entries.insert("fsGroup".to_string(), json!(gid));
    }
    if entries.is_empty() {
        JsonValue::Null
    } else {
        JsonValue::Object(entries)
    }
}

/// Map a resource spec pair onto Kubernetes resource names. Absent specs
/// collapse to null so templates can skip the block.
fn resources_context(limits: &ResourceSpec, requests: &ResourceSpec) -> JsonValue {
    let section = |spec: &ResourceSpec| -> Option<JsonValue> {
        if spec.is_empty() {
            return None;
        }
        let mut entries = Map::new();
        if let Some(cpus) = &spec.cpus {
            entries.insert("cpu".to_string(), json!(cpus));
        }
        if let Some(memory) = &spec.memory {
            entries.insert("memory".to_string(), json!(memory));
        }
        if let Some(gpus) = &spec.gpus {
            entries.insert("nvidia.com/gpu".to_string(), json!(gpus));
        }
        Some(JsonValue::Object(entries))
    };
    match (section(limits), section(requests)) {
        (None, None) => JsonValue::Null,
        (limits, requests) => json!({
            "limits": limits,
            "requests": requests,
        }),
    }
}

/// Bare addresses become single-host blocks.
fn normalize_cidr(cidr: &str) -> String {
    if cidr.contains('/') {
        cidr.to_string()
    } else {
        format!("{cidr}/32")
    }
}

fn single_document(template: &str, mut documents: Vec<Value>) -> Result<Value> {
    if documents.len() != 1 {
        return Err(TychoError::Template {
            template: template.to_string(),
            detail: format!("expected one document, rendered {}", documents.len()),
        });
    }
    Ok(documents.remove(0))
}

/// Built-in manifest templates. A template directory listed in the engine
/// configuration overrides any of these by file name.
const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    ("deployment.yaml", DEPLOYMENT_TEMPLATE),
    ("pvc.yaml", PVC_TEMPLATE),
    ("pv.yaml", PV_TEMPLATE),
    ("service.yaml", SERVICE_TEMPLATE),
    ("netpolicy.yaml", NETWORK_POLICY_TEMPLATE),
];

const DEPLOYMENT_TEMPLATE: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{name}}
  namespace: {{namespace}}
  labels:
{{#each labels}}
    {{@key}}: "{{this}}"
{{/each}}
  {{#if annotations}}
  annotations:
  {{#each annotations}}
    {{@key}}: "{{this}}"
  {{/each}}
  {{/if}}
spec:
  replicas: 1
  selector:
    matchLabels:
      name: {{name}}
  template:
    metadata:
      labels:
{{#each labels}}
        {{@key}}: "{{this}}"
{{/each}}
    spec:
      serviceAccountName: {{service_account}}
      {{#if security_context}}
      securityContext:
      {{#each security_context}}
        {{@key}}: {{this}}
      {{/each}}
      {{/if}}
      containers:
{{#each containers}}
      - name: {{name}}
        image: {{image}}
        {{#if command}}
        command:
        {{#each command}}
        - "{{this}}"
        {{/each}}
        {{/if}}
        {{#if env}}
        env:
        {{#each env}}
        - name: "{{name}}"
          value: "{{value}}"
        {{/each}}
        {{/if}}
        {{#if ports}}
        ports:
        {{#each ports}}
        - containerPort: {{this}}
        {{/each}}
        {{/if}}
        {{#if resources}}
        resources:
          {{#if resources.limits}}
          limits:
          {{#each resources.limits}}
            {{@key}}: "{{this}}"
          {{/each}}
          {{/if}}
          {{#if resources.requests}}
          requests:
          {{#each resources.requests}}
            {{@key}}: "{{this}}"
          {{/each}}
          {{/if}}
        {{/if}}
        {{#if security_context}}
        securityContext:
        {{#each security_context}}
          {{@key}}: {{this}}
        {{/each}}
        {{/if}}
        {{#if mounts}}
        volumeMounts:
        {{#each mounts}}
        - name: {{name}}
          mountPath: {{path}}
          {{#if subpath}}
          subPath: {{subpath}}
          {{/if}}
        {{/each}}
        {{/if}}
{{/each}}
      {{#if pod_volumes}}
      volumes:
      {{#each pod_volumes}}
      - name: {{name}}
        persistentVolumeClaim:
          claimName: {{claim}}
      {{/each}}
      {{/if}}
"#;

const PVC_TEMPLATE: &str = r#"
{{#each claims}}
---
apiVersion: v1
kind: PersistentVolumeClaim
metadata:
  name: {{this.name}}
  labels:
{{#each ../labels}}
    {{@key}}: "{{this}}"
{{/each}}
spec:
  storageClassName: manual
  accessModes:
    - ReadWriteMany
  resources:
    requests:
      storage: 2Gi
  volumeName: {{this.volume_name}}
{{/each}}
"#;

const PV_TEMPLATE: &str = r#"
{{#each claims}}
---
apiVersion: v1
kind: PersistentVolume
metadata:
  name: {{this.volume_name}}
  labels:
{{#each ../labels}}
    {{@key}}: "{{this}}"
{{/each}}
spec:
  storageClassName: manual
  capacity:
    storage: 2Gi
  accessModes:
    - ReadWriteMany
  hostPath:
    path: "/data/{{this.volume_name}}"
{{/each}}
"#;

const SERVICE_TEMPLATE: &str = r#"
{{#each exposures}}
---
apiVersion: v1
kind: Service
metadata:
  name: {{this.name}}
  labels:
{{#each ../labels}}
    {{@key}}: "{{this}}"
{{/each}}
spec:
  type: {{../service_type}}
  selector:
    name: {{../name}}
  ports:
  - name: http
    port: {{this.port}}
    targetPort: {{this.port}}
    protocol: TCP
{{/each}}
"#;

const NETWORK_POLICY_TEMPLATE: &str = r#"
apiVersion: networking.k8s.io/v1
kind: NetworkPolicy
metadata:
  name: {{name}}-netpolicy
  namespace: {{namespace}}
  labels:
{{#each labels}}
    {{@key}}: "{{this}}"
{{/each}}
spec:
  podSelector:
    matchLabels:
      tycho-guid: "{{identifier}}"
  policyTypes:
  - Ingress
  ingress:
{{#each rules}}
  - from:
    - ipBlock:
        cidr: "{{this.cidr}}"
    ports:
    - protocol: TCP
      port: {{this.port}}
{{/each}}
"#;
