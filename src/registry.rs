use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

use crate::config::EngineConfig;
use crate::model::{ResourceSpec, SecurityContext};
use crate::template::TemplateEngine;
use crate::{Result, TychoError};

/// Branch substituted into repository URLs when DOCKSTORE_APPS_BRANCH is
/// not set.
const DEFAULT_APPS_BRANCH: &str = "master";

/// The registry document as authored in `conf/app-registry.yaml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryDoc {
    #[serde(default)]
    pub metadata: Option<serde_yaml::Value>,
    #[serde(default)]
    pub repositories: Vec<Repository>,
    #[serde(default)]
    pub contexts: HashMap<String, ProductContext>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Repository {
    pub id: String,
    pub url: String,
}

/// A product scope: the apps it offers plus the contexts it inherits from.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProductContext {
    #[serde(default)]
    pub extends: Vec<String>,
    #[serde(default)]
    pub apps: HashMap<String, AppMeta>,
}

/// Catalog entry for one launchable app.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppMeta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// URL of the compose document; synthesized from the first repository
    /// when absent
    #[serde(default)]
    pub spec: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub docs: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Exposed services: name to container port
    #[serde(default)]
    pub services: BTreeMap<String, u16>,
    #[serde(default)]
    pub service_account: Option<String>,
    #[serde(default)]
    pub security_context: Option<SecurityContext>,
    #[serde(default)]
    pub conn_string: Option<String>,
    #[serde(default)]
    pub resource_request: Option<ResourceSpec>,
}

impl AppMeta {
    /// Overlay set fields of `other` onto self. Used when a child context
    /// redefines an inherited app: what the child sets wins, the rest is
    /// kept from the parent.
    fn merge_over(&mut self, other: &AppMeta) {
        if other.name.is_some() {
            self.name = other.name.clone();
        }
        if other.description.is_some() {
            self.description = other.description.clone();
        }
        if other.spec.is_some() {
            self.spec = other.spec.clone();
        }
        if other.icon.is_some() {
            self.icon = other.icon.clone();
        }
        if other.docs.is_some() {
            self.docs = other.docs.clone();
        }
        for (key, value) in &other.env {
            self.env.insert(key.clone(), value.clone());
        }
        if !other.services.is_empty() {
            self.services = other.services.clone();
        }
        if other.service_account.is_some() {
            self.service_account = other.service_account.clone();
        }
        if other.security_context.is_some() {
            self.security_context = other.security_context.clone();
        }
        if other.conn_string.is_some() {
            self.conn_string = other.conn_string.clone();
        }
        if other.resource_request.is_some() {
            self.resource_request = other.resource_request.clone();
        }
    }
}

/// A fetched-and-parsed app spec with its sibling settings file.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub spec: serde_yaml::Value,
    pub env_text: String,
}

/// Read-mostly memo of fetched app specs. The write lock is held only for
/// the first populate of an entry.
#[derive(Default)]
pub struct RegistryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl RegistryCache {
    pub async fn get(&self, app_id: &str) -> Option<CacheEntry> {
        self.entries.read().await.get(app_id).cloned()
    }

    pub async fn put(&self, app_id: &str, entry: CacheEntry) -> CacheEntry {
        let mut entries = self.entries.write().await;
        entries
            .entry(app_id.to_string())
            .or_insert(entry)
            .clone()
    }

    pub async fn invalidate(&self, app_id: &str) {
        self.entries.write().await.remove(app_id);
    }
}

/// Loads the app catalog, resolves product contexts with inheritance, and
/// serves cached app specs.
pub struct AppRegistry {
    doc: RegistryDoc,
    repositories: HashMap<String, String>,
    cache: RegistryCache,
    http: reqwest::Client,
}

impl AppRegistry {
    /// Read the registry document from the configured location.
    pub fn load(config: &EngineConfig) -> Result<Self> {
        let text = std::fs::read_to_string(&config.registry_path).map_err(|e| {
            TychoError::Config(format!(
                "cannot read registry {}: {e}",
                config.registry_path.display()
            ))
        })?;
        let doc: RegistryDoc = serde_yaml::from_str(&text)
            .map_err(|e| TychoError::Config(format!("malformed registry: {e}")))?;
        Self::from_document(doc, config)
    }

    /// Build a registry from an already-parsed document.
    pub fn from_document(doc: RegistryDoc, config: &EngineConfig) -> Result<Self> {
        let branch =
            std::env::var("DOCKSTORE_APPS_BRANCH").unwrap_or_else(|_| DEFAULT_APPS_BRANCH.into());
        let branch_vars: HashMap<String, String> =
            [("branch".to_string(), branch)].into_iter().collect();
        let repositories: HashMap<String, String> = doc
            .repositories
            .iter()
            .map(|r| {
                (
                    r.id.clone(),
                    TemplateEngine::safe_substitute(&r.url, &branch_vars),
                )
            })
            .collect();
        info!("repository context: {:?}", repositories);

        let http = reqwest::Client::builder()
            .timeout(config.registry_timeout)
            .build()?;

        Ok(Self {
            doc,
            repositories,
            cache: RegistryCache::default(),
            http,
        })
    }

    /// Resolve the catalog visible under a product, walking `extends`
    /// depth-first so children override their bases app by app.
    pub fn resolve(&self, product: &str) -> Result<BTreeMap<String, AppMeta>> {
        if !self.doc.contexts.contains_key(product) {
            return Err(TychoError::ContextNotFound(product.to_string()));
        }
        let mut apps = BTreeMap::new();
        let mut visited = HashSet::new();
        self.inherit(product, &mut apps, &mut visited)?;
        for (app_id, app) in apps.iter_mut() {
            self.compile_app(app_id, app)?;
        }
        Ok(apps)
    }

    fn inherit(
        &self,
        product: &str,
        apps: &mut BTreeMap<String, AppMeta>,
        visited: &mut HashSet<String>,
    ) -> Result<()> {
        let context = self
            .doc
            .contexts
            .get(product)
            .ok_or_else(|| TychoError::BaseNotFound(product.to_string()))?;
        if !visited.insert(product.to_string()) {
            return Ok(());
        }
        for base in &context.extends {
            self.inherit(base, apps, visited)?;
        }
        for (app_id, app) in &context.apps {
            match apps.get_mut(app_id) {
                Some(inherited) => inherited.merge_over(app),
                None => {
                    apps.insert(app_id.clone(), app.clone());
                }
            }
        }
        Ok(())
    }

    /// Fill in synthesized URLs and expand repository variables.
    fn compile_app(&self, app_id: &str, app: &mut AppMeta) -> Result<()> {
        if app.spec.is_none() {
            let first = self.doc.repositories.first().ok_or_else(|| {
                TychoError::Config("registry declares no repositories".to_string())
            })?;
            let base = self
                .repositories
                .get(&first.id)
                .cloned()
                .unwrap_or_else(|| first.url.clone());
            app.spec = Some(format!("{base}/{app_id}/docker-compose.yaml"));
        }
        for url in [&mut app.spec, &mut app.icon, &mut app.docs] {
            if let Some(text) = url {
                *text = TemplateEngine::safe_substitute(text, &self.repositories);
            }
        }
        if app.icon.is_none() {
            let spec = app.spec.as_deref().unwrap_or_default();
            app.icon = Some(format!("{}/icon.png", dirname(spec)));
        }
        Ok(())
    }

    /// Look up an app in the product's resolved catalog. Apps outside the
    /// catalog cannot be launched.
    pub fn launchable(&self, product: &str, app_id: &str) -> Result<AppMeta> {
        let apps = self.resolve(product)?;
        apps.get(app_id)
            .cloned()
            .ok_or_else(|| TychoError::AppNotAuthorized(app_id.to_string()))
    }

    /// Fetch (or reuse) the compose spec and sibling `.env` for an app.
    pub async fn fetch(&self, app_id: &str, app: &AppMeta) -> Result<CacheEntry> {
        if let Some(entry) = self.cache.get(app_id).await {
            debug!("registry cache hit for {app_id}");
            return Ok(entry);
        }
        let url = app
            .spec
            .as_deref()
            .ok_or_else(|| TychoError::Config(format!("app '{app_id}' has no spec url")))?;
        debug!("resolving specification for app {app_id} from {url}");
        let spec_text = self.get_text(url).await?;
        let spec: serde_yaml::Value = serde_yaml::from_str(&spec_text)
            .map_err(|e| TychoError::InvalidCompose(format!("spec at {url}: {e}")))?;

        let env_url = format!("{}/.env", dirname(url));
        let env_text = match self.http.get(&env_url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("got settings for {app_id}");
                response.text().await.unwrap_or_default()
            }
            _ => {
                debug!("using empty settings for {app_id}");
                String::new()
            }
        };

        Ok(self.cache.put(app_id, CacheEntry { spec, env_text }).await)
    }

    /// Drop the cached spec for an app so the next launch re-fetches it.
    pub async fn invalidate(&self, app_id: &str) {
        self.cache.invalidate(app_id).await;
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let response = self.http.get(url).send().await.map_err(map_fetch_error)?;
        if !response.status().is_success() {
            return Err(TychoError::Config(format!(
                "fetch of {url} returned {}",
                response.status()
            )));
        }
        response.text().await.map_err(map_fetch_error)
    }
}

fn map_fetch_error(error: reqwest::Error) -> TychoError {
    if error.is_timeout() {
        TychoError::Timeout(format!("registry fetch: {error}"))
    } else {
        TychoError::Http(error)
    }
}

fn dirname(url: &str) -> &str {
    url.rsplit_once('/').map(|(base, _)| base).unwrap_or(url)
}
