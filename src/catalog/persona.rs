use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::Deserialize;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{info, warn};

use crate::browser::{self, Priority};
use crate::credential::Credential;
use crate::egress::{EgressPool, OutboundRequest};
use crate::logging::make_body_preview;

use super::is_stale;
use super::registry::ModelEntry;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawPersona")]
pub struct PersonaEntry {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub provider_override: Option<String>,
    pub model_override: Option<String>,
    pub is_public: bool,
}

#[derive(Deserialize)]
struct RawPersona {
    id: u64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    llm_model_provider_override: Option<String>,
    #[serde(default)]
    llm_model_version_override: Option<String>,
    #[serde(default)]
    is_public: bool,
}

impl From<RawPersona> for PersonaEntry {
    fn from(raw: RawPersona) -> Self {
        let non_empty = |s: Option<String>| s.filter(|v| !v.trim().is_empty());
        Self {
            id: raw.id,
            name: raw.name.unwrap_or_default(),
            description: raw.description.unwrap_or_default(),
            provider_override: non_empty(raw.llm_model_provider_override),
            model_override: non_empty(raw.llm_model_version_override),
            is_public: raw.is_public,
        }
    }
}

#[derive(Debug, Default)]
pub struct PersonaGeneration {
    personas: Vec<PersonaEntry>,
    by_model: HashMap<String, usize>,
    loaded_at: Option<Instant>,
}

impl PersonaGeneration {
    pub fn new(personas: Vec<PersonaEntry>) -> Self {
        let mut by_model = HashMap::new();
        for (idx, p) in personas.iter().enumerate() {
            if let Some(model) = &p.model_override {
                // later personas override earlier ones for the same model
                by_model.insert(model.clone(), idx);
            }
        }
        Self {
            personas,
            by_model,
            loaded_at: Some(Instant::now()),
        }
    }

    pub fn lookup(&self, model: &str) -> Option<&PersonaEntry> {
        self.by_model.get(model).map(|&idx| &self.personas[idx])
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn mapped_models(&self) -> usize {
        self.by_model.len()
    }

    pub fn loaded_at(&self) -> Option<Instant> {
        self.loaded_at
    }

    /// One entry per distinct override model, in persona order.
    pub fn derived_models(&self, created: i64) -> Vec<ModelEntry> {
        let mut seen = HashSet::new();
        self.personas
            .iter()
            .filter_map(|p| {
                let model = p.model_override.as_ref()?;
                if !seen.insert(model.clone()) {
                    return None;
                }
                Some(ModelEntry {
                    id: model.clone(),
                    owned_by: p.provider_override.clone().unwrap_or_default(),
                    api_provider: None,
                    category: None,
                    persona_id: Some(p.id),
                    created,
                })
            })
            .collect()
    }
}

/// Periodically fetched persona table from `GET {session_base}/persona`.
pub struct PersonaCache {
    url: String,
    origin: String,
    egress: Arc<EgressPool>,
    credential: Arc<Credential>,
    refresh_interval: Duration,
    current: AsyncRwLock<Arc<PersonaGeneration>>,
}

impl PersonaCache {
    pub fn new(
        session_base: &str,
        origin: &str,
        egress: Arc<EgressPool>,
        credential: Arc<Credential>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            url: format!("{}/persona", session_base.trim_end_matches('/')),
            origin: origin.to_string(),
            egress,
            credential,
            refresh_interval,
            current: AsyncRwLock::new(Arc::new(PersonaGeneration::default())),
        }
    }

    pub async fn snapshot(&self) -> Arc<PersonaGeneration> {
        self.current.read().await.clone()
    }

    pub async fn install(&self, personas: Vec<PersonaEntry>) {
        *self.current.write().await = Arc::new(PersonaGeneration::new(personas));
    }

    async fn fetch(&self) -> Result<Vec<PersonaEntry>> {
        let headers =
            browser::upstream_headers(&self.origin, Priority::Random, Some(self.credential.get()));
        let out = self
            .egress
            .dispatch(OutboundRequest::get(self.url.clone(), headers))
            .await?;
        let status = out.response.status();
        let body = out.response.bytes().await?;
        if !status.is_success() {
            let preview = make_body_preview(&body, None, 200);
            return Err(anyhow!("status {}: {}", status.as_u16(), preview.data));
        }
        Ok(serde_json::from_slice(&body)?)
    }

    /// Fetches and installs a new generation. Failures leave the previous one in place.
    pub async fn refresh(&self) -> Result<usize> {
        match self.fetch().await {
            Ok(personas) => {
                let n = personas.len();
                self.install(personas).await;
                let snap = self.snapshot().await;
                info!(
                    "refreshed {} personas, {} model mappings",
                    n,
                    snap.mapped_models()
                );
                Ok(n)
            }
            Err(err) => {
                let snap = self.snapshot().await;
                if snap.loaded_at().is_some() && is_stale(snap.loaded_at(), self.refresh_interval) {
                    warn!(
                        "persona cache is stale, still serving {} personas",
                        snap.len()
                    );
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{gateway_config, spawn_axum_server};
    use axum::http::HeaderMap;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn persona(id: u64, provider: &str, model: &str) -> PersonaEntry {
        PersonaEntry {
            id,
            name: String::new(),
            description: String::new(),
            provider_override: Some(provider.to_string()),
            model_override: Some(model.to_string()),
            is_public: true,
        }
    }

    #[test]
    fn duplicate_model_overrides_keep_the_last_persona() {
        let g = PersonaGeneration::new(vec![persona(1, "a", "m"), persona(2, "b", "m")]);
        assert_eq!(g.lookup("m").map(|p| p.id), Some(2));
        assert_eq!(g.mapped_models(), 1);
    }

    #[test]
    fn derived_models_are_unique_and_owned_by_provider() {
        let g = PersonaGeneration::new(vec![
            persona(1, "acme", "m1"),
            persona(2, "other", "m1"),
            persona(3, "zeta", "m2"),
        ]);
        let models = g.derived_models(5);
        let pairs: Vec<_> = models
            .iter()
            .map(|m| (m.id.as_str(), m.owned_by.as_str()))
            .collect();
        assert_eq!(pairs, vec![("m1", "acme"), ("m2", "zeta")]);
    }

    #[test]
    fn empty_overrides_are_ignored() {
        let raw = json!([{"id": 4, "name": "n", "llm_model_provider_override": "", "llm_model_version_override": null}]);
        let personas: Vec<PersonaEntry> = serde_json::from_value(raw).unwrap();
        assert_eq!(personas[0].model_override, None);
        assert!(PersonaGeneration::new(personas).derived_models(0).is_empty());
    }

    #[tokio::test]
    async fn refresh_fetches_with_credentials_and_installs() {
        let app = axum::Router::new().route(
            "/sv5/persona",
            get(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if auth != "Bearer test-upstream-key" {
                    return (axum::http::StatusCode::UNAUTHORIZED, "no").into_response();
                }
                axum::Json(json!([
                    {"id": 11, "name": "p", "description": "", "llm_model_provider_override": "acme",
                     "llm_model_version_override": "m1", "is_public": true}
                ]))
                .into_response()
            }),
        );
        let (addr, handle) = spawn_axum_server(app);

        let cfg = gateway_config(&[]);
        let egress = Arc::new(EgressPool::new(&cfg).unwrap());
        let cache = PersonaCache::new(
            &format!("http://{addr}/sv5"),
            &format!("http://{addr}"),
            egress,
            Arc::new(Credential::new(cfg.upstream_api_key.clone())),
            Duration::from_secs(300),
        );
        assert_eq!(cache.refresh().await.unwrap(), 1);
        assert_eq!(cache.snapshot().await.lookup("m1").map(|p| p.id), Some(11));
        handle.abort();
    }

    #[tokio::test]
    async fn refresh_failure_keeps_old_generation() {
        let app = axum::Router::new().route(
            "/sv5/persona",
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down") }),
        );
        let (addr, handle) = spawn_axum_server(app);
        let cfg = gateway_config(&[]);
        let cache = PersonaCache::new(
            &format!("http://{addr}/sv5"),
            &format!("http://{addr}"),
            Arc::new(EgressPool::new(&cfg).unwrap()),
            Arc::new(Credential::new(None)),
            Duration::from_secs(300),
        );
        cache.install(vec![persona(1, "acme", "m1")]).await;
        let err = cache.refresh().await.unwrap_err().to_string();
        assert!(err.contains("503"), "{err}");
        assert_eq!(cache.snapshot().await.len(), 1);
        handle.abort();
    }
}
