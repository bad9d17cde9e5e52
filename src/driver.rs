use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::config::EngineConfig;
use crate::model::{
    LaunchResult, ResourceSpec, ServiceAddress, ServiceStatus, System,
};
use crate::projection::{ManifestSet, Projection};
use crate::{Result, TychoError};

/// A requested change to a running system.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Modification {
    pub guid: String,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub resources: Option<ResourceSpec>,
    #[serde(default)]
    pub replicas: Option<i32>,
}

/// Applies, observes, and reclaims the artifacts of a system on a
/// Kubernetes cluster.
///
/// Start applies manifests in dependency order (claims before volumes
/// before the deployment, services last) and performs a full label-scoped
/// reclamation when any step fails. Delete is non-strict: artifacts that
/// are already gone count as deleted.
pub struct KubernetesDriver {
    client: Client,
    namespace: String,
    platform_ip: Option<String>,
    deadline: Duration,
    projection: Projection,
}

impl KubernetesDriver {
    /// Connect with inferred credentials: in-cluster when
    /// KUBERNETES_SERVICE_HOST is present, kubeconfig otherwise.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        let client = Client::try_default().await?;
        Self::new(client, config)
    }

    pub fn new(client: Client, config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            client,
            namespace: config.namespace.clone(),
            platform_ip: config.platform_ip.clone(),
            deadline: config.orchestrator_timeout,
            projection: Projection::new(config)?,
        })
    }

    /// Project and start a system. On any failure after projection, every
    /// artifact carrying the system's GUID is reclaimed before the error
    /// propagates.
    pub async fn start(&self, system: &System) -> Result<LaunchResult> {
        let manifests = self.projection.project(system)?;

        // Covers cancellation: if this future is dropped mid-apply, the
        // guard schedules the same reclamation the error path runs inline.
        let mut guard = ReclaimGuard::new(
            self.client.clone(),
            self.namespace.clone(),
            system.identifier.clone(),
            self.deadline,
        );
        let outcome = self.apply(system, &manifests).await;
        guard.release();

        match outcome {
            Ok(result) => Ok(result),
            Err(cause) => {
                warn!("start of {} failed, reclaiming: {cause}", system.name);
                if let Err(delete_error) = self.delete(&system.identifier).await {
                    error!(
                        "reclamation after failed start of {} incomplete: {delete_error}",
                        system.name
                    );
                }
                Err(TychoError::Start {
                    system: system.name.clone(),
                    cause: Box::new(cause),
                })
            }
        }
    }

    async fn apply(&self, system: &System, manifests: &ManifestSet) -> Result<LaunchResult> {
        let pvcs: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &self.namespace);
        for document in &manifests.pvcs {
            let pvc: PersistentVolumeClaim = decode("pvc.yaml", document)?;
            info!(
                "creating pvc {} for {}",
                pvc.metadata.name.as_deref().unwrap_or("?"),
                system.name
            );
            self.create("create pvc", &pvcs, &pvc).await?;
        }

        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        for document in &manifests.pvs {
            let pv: PersistentVolume = decode("pv.yaml", document)?;
            info!(
                "creating pv {} for {}",
                pv.metadata.name.as_deref().unwrap_or("?"),
                system.name
            );
            self.create("create pv", &pvs, &pv).await?;
        }

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let deployment: Deployment = decode("deployment.yaml", &manifests.deployment)?;
        info!("creating deployment {}", system.name);
        self.create("create deployment", &deployments, &deployment)
            .await?;

        if let Some(document) = &manifests.network_policy {
            let policies: Api<NetworkPolicy> =
                Api::namespaced(self.client.clone(), &self.namespace);
            let policy: NetworkPolicy = decode("netpolicy.yaml", document)?;
            info!("creating network policy for {}", system.name);
            self.create("create network policy", &policies, &policy)
                .await?;
        }

        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut addresses = Vec::new();
        for (document, exposure) in manifests.services.iter().zip(system.services.iter()) {
            let service: Service = decode("service.yaml", document)?;
            info!(
                "creating service {} exposing port {}",
                exposure.name, exposure.port
            );
            let created = self
                .bounded("create service", services.create(&PostParams::default(), &service))
                .await?;
            addresses.push(service_address(
                self.platform_ip.as_deref(),
                &exposure.name_noid,
                &created,
            ));
        }

        Ok(LaunchResult {
            name: system.name.clone(),
            sid: system.identifier.clone(),
            services: addresses,
            conn_string: system.conn_string.clone(),
            status: "success".to_string(),
        })
    }

    /// Create one artifact; an already-existing artifact with the same name
    /// counts as created, which makes retried starts converge.
    async fn create<K>(&self, what: &str, api: &Api<K>, value: &K) -> Result<()>
    where
        K: kube::Resource + Clone + serde::de::DeserializeOwned + serde::Serialize + std::fmt::Debug,
    {
        match timeout(self.deadline, api.create(&PostParams::default(), value)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(kube::Error::Api(ae))) if ae.code == 409 => {
                debug!("{what}: already exists");
                Ok(())
            }
            Ok(Err(e)) => Err(TychoError::Kube(e)),
            Err(_) => Err(TychoError::Timeout(format!(
                "{what} after {:?}",
                self.deadline
            ))),
        }
    }

    async fn bounded<T, F>(&self, what: &str, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>>,
    {
        match timeout(self.deadline, call).await {
            Ok(result) => result.map_err(TychoError::from),
            Err(_) => Err(TychoError::Timeout(format!(
                "{what} after {:?}",
                self.deadline
            ))),
        }
    }

    /// Status of every tycho-launched system, or of one GUID.
    pub async fn status(&self, name: Option<&str>) -> Result<Vec<ServiceStatus>> {
        let selector = match name {
            Some(guid) => format!("tycho-guid={guid}"),
            None => "executor=tycho".to_string(),
        };
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let found = self
            .bounded(
                "list deployments",
                deployments.list(&ListParams::default().labels(&selector)),
            )
            .await?;

        let mut result = Vec::new();
        for deployment in found.items {
            let labels = deployment.metadata.labels.clone().unwrap_or_default();
            let Some(guid) = labels.get("tycho-guid") else {
                continue;
            };
            let owned = self
                .bounded(
                    "list services",
                    services.list(&ListParams::default().labels(&format!("tycho-guid={guid}"))),
                )
                .await?;
            for service in owned.items {
                let address = service_address(
                    self.platform_ip.as_deref(),
                    service.metadata.name.as_deref().unwrap_or_default(),
                    &service,
                );
                result.push(ServiceStatus {
                    name: address.name,
                    sid: Some(guid.clone()),
                    ip_address: address.ip_address,
                    port: address.port.map(|p| p.to_string()),
                    creation_time: service
                        .metadata
                        .creation_timestamp
                        .as_ref()
                        .map(|t| t.0.to_rfc3339()),
                    app_id: labels.get("app_id").cloned(),
                });
            }
        }
        Ok(result)
    }

    /// Reclaim every artifact labeled with the GUID. Safe to retry; a
    /// second call over an empty namespace is a no-op.
    pub async fn delete(&self, guid: &str) -> Result<()> {
        reclaim_system(
            self.client.clone(),
            self.namespace.clone(),
            guid.to_string(),
            self.deadline,
        )
        .await
    }

    /// Patch replicas, labels, or container resources on the deployment
    /// carrying the GUID. Does nothing when nothing differs.
    pub async fn modify(&self, modification: Modification) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let found = self
            .bounded(
                "list deployments",
                deployments.list(
                    &ListParams::default().labels(&format!("tycho-guid={}", modification.guid)),
                ),
            )
            .await?;
        for deployment in found.items {
            let Some(name) = deployment.metadata.name.clone() else {
                continue;
            };
            match build_patch(&deployment, &modification) {
                Some(patch) => {
                    info!("patching deployment {name}: {patch}");
                    self.bounded(
                        "patch deployment",
                        deployments.patch(&name, &PatchParams::default(), &Patch::Strategic(&patch)),
                    )
                    .await?;
                }
                None => debug!("modify: nothing differs for {name}"),
            }
        }
        Ok(())
    }
}

fn decode<K: serde::de::DeserializeOwned>(kind: &str, document: &serde_yaml::Value) -> Result<K> {
    serde_yaml::from_value(document.clone()).map_err(|e| TychoError::Template {
        template: kind.to_string(),
        detail: format!("manifest does not decode: {e}"),
    })
}

/// Address of a created service: the load-balancer ingress IP when one was
/// allocated, the configured platform IP otherwise; the node port when one
/// was allocated, the declared port otherwise.
fn service_address(platform_ip: Option<&str>, name: &str, service: &Service) -> ServiceAddress {
    let ingress_ip = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|i| i.ip.clone());
    let port = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|p| p.node_port.unwrap_or(p.port));
    ServiceAddress {
        name: name.to_string(),
        ip_address: ingress_ip.or_else(|| platform_ip.map(str::to_string)),
        port,
    }
}

/// Strategic-merge patch realizing a modification, or None when the
/// deployment already matches.
fn build_patch(deployment: &Deployment, modification: &Modification) -> Option<JsonValue> {
    let mut patch = Map::new();

    if let Some(replicas) = modification.replicas {
        let current = deployment.spec.as_ref().and_then(|s| s.replicas);
        if current != Some(replicas) {
            patch.insert("spec".to_string(), json!({ "replicas": replicas }));
        }
    }

    if let Some(labels) = &modification.labels {
        let current = deployment.metadata.labels.clone().unwrap_or_default();
        let changed: BTreeMap<&String, &String> = labels
            .iter()
            .filter(|(key, value)| current.get(*key) != Some(value))
            .collect();
        if !changed.is_empty() {
            patch.insert("metadata".to_string(), json!({ "labels": changed }));
        }
    }

    if let Some(resources) = &modification.resources {
        if let Some(containers) = resource_patches(deployment, resources) {
            let spec = patch
                .entry("spec".to_string())
                .or_insert_with(|| json!({}));
            spec.as_object_mut()
                .expect("spec patch object")
                .insert(
                    "template".to_string(),
                    json!({ "spec": { "containers": containers } }),
                );
        }
    }

    if patch.is_empty() {
        None
    } else {
        Some(JsonValue::Object(patch))
    }
}

/// Per-container resource patches for containers whose current requests or
/// limits differ from the desired spec.
fn resource_patches(deployment: &Deployment, desired: &ResourceSpec) -> Option<Vec<JsonValue>> {
    let containers = deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .as_slice();

    let mut section = Map::new();
    if let Some(cpus) = &desired.cpus {
        section.insert("cpu".to_string(), json!(cpus));
    }
    if let Some(memory) = &desired.memory {
        section.insert("memory".to_string(), json!(memory));
    }
    if let Some(gpus) = &desired.gpus {
        section.insert("nvidia.com/gpu".to_string(), json!(gpus));
    }
    if section.is_empty() {
        return None;
    }

    let patches: Vec<JsonValue> = containers
        .iter()
        .filter(|container| {
            let current = container.resources.as_ref();
            let lookup = |map: Option<&BTreeMap<String, Quantity>>, key: &str| {
                map.and_then(|m| m.get(key)).map(|q| q.0.clone())
            };
            section.iter().any(|(key, value)| {
                let desired_value = value.as_str().map(str::to_string);
                lookup(current.and_then(|r| r.requests.as_ref()), key) != desired_value
                    || lookup(current.and_then(|r| r.limits.as_ref()), key) != desired_value
            })
        })
        .map(|container| {
            json!({
                "name": container.name,
                "resources": {
                    "requests": section,
                    "limits": section,
                }
            })
        })
        .collect();

    if patches.is_empty() {
        None
    } else {
        Some(patches)
    }
}

/// Full label-scoped reclamation for one GUID. Services lack a collection
/// delete endpoint, so they are enumerated and removed one by one; every
/// other kind goes through a collection delete; cluster-scoped volumes go
/// last. Not-found means already reclaimed.
async fn reclaim_system(
    client: Client,
    namespace: String,
    guid: String,
    deadline: Duration,
) -> Result<()> {
    let selector = format!("tycho-guid={guid}");
    let lp = ListParams::default().labels(&selector);
    let dp = DeleteParams::default();

    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
    let found = match timeout(deadline, services.list(&lp)).await {
        Ok(Ok(list)) => list,
        Ok(Err(e)) => return Err(TychoError::Delete(format!("list services: {e}"))),
        Err(_) => return Err(TychoError::Timeout("list services".to_string())),
    };
    for service in found.items {
        if let Some(name) = &service.metadata.name {
            info!(" --deleting service {name} in namespace {namespace}");
            reclaim_step(deadline, &format!("service {name}"), services.delete(name, &dp)).await?;
        }
    }

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &namespace);
    info!(" --deleting deployments for {guid} in namespace {namespace}");
    reclaim_step(deadline, "deployments", deployments.delete_collection(&dp, &lp)).await?;

    let replica_sets: Api<ReplicaSet> = Api::namespaced(client.clone(), &namespace);
    info!(" --deleting replica sets for {guid} in namespace {namespace}");
    reclaim_step(deadline, "replica sets", replica_sets.delete_collection(&dp, &lp)).await?;

    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    info!(" --deleting pods for {guid} in namespace {namespace}");
    reclaim_step(deadline, "pods", pods.delete_collection(&dp, &lp)).await?;

    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &namespace);
    info!(" --deleting persistent volume claims for {guid} in namespace {namespace}");
    reclaim_step(deadline, "persistent volume claims", pvcs.delete_collection(&dp, &lp)).await?;

    let policies: Api<NetworkPolicy> = Api::namespaced(client.clone(), &namespace);
    info!(" --deleting network policies for {guid} in namespace {namespace}");
    reclaim_step(deadline, "network policies", policies.delete_collection(&dp, &lp)).await?;

    let pvs: Api<PersistentVolume> = Api::all(client);
    info!(" --deleting persistent volumes for {guid}");
    reclaim_step(deadline, "persistent volumes", pvs.delete_collection(&dp, &lp)).await?;

    Ok(())
}

/// One reclamation call: not-found is success, anything else aborts the
/// remaining steps.
async fn reclaim_step<T, F>(deadline: Duration, what: &str, call: F) -> Result<()>
where
    F: Future<Output = std::result::Result<T, kube::Error>>,
{
    match timeout(deadline, call).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(kube::Error::Api(ae))) if ae.code == 404 => {
            debug!("{what}: already gone");
            Ok(())
        }
        Ok(Err(e)) => Err(TychoError::Delete(format!("{what}: {e}"))),
        Err(_) => Err(TychoError::Timeout(format!("{what} during reclamation"))),
    }
}

/// Scoped reclamation handle. If a start is cancelled before `release`,
/// dropping the guard schedules the same label-scoped reclamation a failed
/// start performs inline.
struct ReclaimGuard {
    client: Option<Client>,
    namespace: String,
    guid: String,
    deadline: Duration,
}

impl ReclaimGuard {
    fn new(client: Client, namespace: String, guid: String, deadline: Duration) -> Self {
        Self {
            client: Some(client),
            namespace,
            guid,
            deadline,
        }
    }

    fn release(&mut self) {
        self.client = None;
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            let namespace = self.namespace.clone();
            let guid = self.guid.clone();
            let deadline = self.deadline;
            warn!("start of {guid} interrupted; scheduling reclamation");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = reclaim_system(client, namespace, guid.clone(), deadline).await
                    {
                        error!("reclamation of {guid} after cancellation failed: {e}");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServicePort, ServiceSpec,
        ServiceStatus as KubeServiceStatus,
    };
    use kube::api::ObjectMeta;

    fn service(node_port: Option<i32>, ingress_ip: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("jupyter-abc".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: 8888,
                    node_port,
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            status: ingress_ip.map(|ip| KubeServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some(ip.to_string()),
                        ..LoadBalancerIngress::default()
                    }]),
                }),
                ..KubeServiceStatus::default()
            }),
        }
    }

    #[test]
    fn test_service_address_prefers_ingress_ip() {
        let address = service_address(Some("192.168.99.111"), "jupyter", &service(None, Some("34.1.2.3")));
        assert_eq!(address.ip_address.as_deref(), Some("34.1.2.3"));
        assert_eq!(address.port, Some(8888));
    }

    #[test]
    fn test_service_address_falls_back_to_platform_ip() {
        let address = service_address(Some("192.168.99.111"), "jupyter", &service(Some(30888), None));
        assert_eq!(address.ip_address.as_deref(), Some("192.168.99.111"));
        assert_eq!(address.port, Some(30888));
    }

    fn deployment(replicas: i32, labels: &[(&str, &str)]) -> Deployment {
        let labels: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "test", "labels": labels },
            "spec": {
                "replicas": replicas,
                "selector": { "matchLabels": { "name": "test" } },
                "template": {
                    "metadata": { "labels": { "name": "test" } },
                    "spec": {
                        "containers": [{
                            "name": "web",
                            "image": "nginx:1.20",
                            "resources": {
                                "requests": { "cpu": "0.5", "memory": "128M" },
                                "limits": { "cpu": "0.5", "memory": "128M" }
                            }
                        }]
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_modify_noop_when_nothing_differs() {
        let deployment = deployment(1, &[("tycho-guid", "abc")]);
        let modification = Modification {
            guid: "abc".to_string(),
            labels: Some([("tycho-guid".to_string(), "abc".to_string())].into()),
            resources: Some(ResourceSpec {
                cpus: Some("0.5".to_string()),
                gpus: None,
                memory: Some("128M".to_string()),
            }),
            replicas: Some(1),
        };
        assert!(build_patch(&deployment, &modification).is_none());
    }

    #[test]
    fn test_modify_patches_changed_fields_only() {
        let deployment = deployment(1, &[("tycho-guid", "abc")]);
        let modification = Modification {
            guid: "abc".to_string(),
            labels: Some([("stage".to_string(), "qa".to_string())].into()),
            resources: None,
            replicas: Some(3),
        };
        let patch = build_patch(&deployment, &modification).unwrap();
        assert_eq!(patch["spec"]["replicas"].as_i64(), Some(3));
        assert_eq!(patch["metadata"]["labels"]["stage"].as_str(), Some("qa"));
        assert!(patch["spec"]["template"].is_null());
    }

    #[test]
    fn test_modify_patches_resources() {
        let deployment = deployment(1, &[]);
        let modification = Modification {
            guid: "abc".to_string(),
            labels: None,
            resources: Some(ResourceSpec {
                cpus: Some("1".to_string()),
                gpus: None,
                memory: None,
            }),
            replicas: None,
        };
        let patch = build_patch(&deployment, &modification).unwrap();
        let containers = patch["spec"]["template"]["spec"]["containers"]
            .as_array()
            .unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0]["name"].as_str(), Some("web"));
        assert_eq!(
            containers[0]["resources"]["requests"]["cpu"].as_str(),
            Some("1")
        );
    }

    #[test]
    fn test_projected_manifests_decode_into_typed_objects() {
        use crate::config::DevPhase;
        use crate::model::{ExposureSpec, LaunchSpec, Principal, SystemParser};

        let config = EngineConfig {
            dev_phase: DevPhase::Test,
            ..EngineConfig::default()
        };
        let compose: serde_yaml::Value = serde_yaml::from_str(
            r#"
services:
  jupyter-datascience:
    image: jupyter/datascience-notebook
    ports:
      - 8888
    volumes:
      - "pvc://cloud-top/projects:/work/data"
"#,
        )
        .unwrap();
        let system = SystemParser::new()
            .parse(
                &config,
                LaunchSpec {
                    name: "decode".to_string(),
                    principal: Principal::new("renci"),
                    compose,
                    service_account: None,
                    env: Vec::new(),
                    services: vec![(
                        "jupyter-datascience".to_string(),
                        ExposureSpec {
                            port: 8888,
                            clients: vec!["127.0.0.1".to_string()],
                        },
                    )],
                    resource_request: None,
                    app_id: None,
                    conn_string: String::new(),
                    security_context: None,
                },
            )
            .unwrap();
        let manifests = Projection::new(&config).unwrap().project(&system).unwrap();

        let deployment: Deployment = decode("deployment.yaml", &manifests.deployment).unwrap();
        assert_eq!(deployment.metadata.name.as_deref(), Some(system.name.as_str()));
        let _: PersistentVolumeClaim = decode("pvc.yaml", &manifests.pvcs[0]).unwrap();
        let _: PersistentVolume = decode("pv.yaml", &manifests.pvs[0]).unwrap();
        let _: NetworkPolicy =
            decode("netpolicy.yaml", manifests.network_policy.as_ref().unwrap()).unwrap();
        let service: Service = decode("service.yaml", &manifests.services[0]).unwrap();
        assert_eq!(
            service.spec.unwrap().selector.unwrap().get("name"),
            Some(&system.name)
        );
    }
}
