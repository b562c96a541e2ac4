//! Model and persona caches that drive dialect routing.

pub mod persona;
pub mod registry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::GatewayConfig;
use crate::credential::Credential;
use crate::egress::EgressPool;
use crate::model_routing::{self, RoutingDecision};
use crate::openai::unix_now;
use crate::tasks::PeriodicTask;

use persona::PersonaCache;
use registry::{ModelEntry, ModelRegistry};

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A generation counts as stale once three refresh intervals have passed.
pub(crate) fn is_stale(loaded_at: Option<Instant>, interval: Duration) -> bool {
    match loaded_at {
        Some(t) => t.elapsed() > interval * 3,
        None => true,
    }
}

pub struct ModelCatalog {
    pub registry: ModelRegistry,
    pub personas: PersonaCache,
    refresh_interval: Duration,
}

impl ModelCatalog {
    pub fn new(
        cfg: &GatewayConfig,
        egress: Arc<EgressPool>,
        credential: Arc<Credential>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            registry: ModelRegistry::new(cfg.models_file.clone(), refresh_interval),
            personas: PersonaCache::new(
                &cfg.session_base_url,
                &cfg.upstream_origin(),
                egress,
                credential,
                refresh_interval,
            ),
            refresh_interval,
        }
    }

    /// First load of both caches. Failures are logged; the gateway still
    /// starts and routes everything direct until a refresh succeeds.
    pub async fn load_initial(&self) {
        if let Err(err) = self.personas.refresh().await {
            warn!("initial persona fetch failed: {:#}", err);
        }
        if let Err(err) = self.registry.refresh().await {
            warn!("initial model registry load failed: {:#}", err);
        }
    }

    pub async fn resolve(&self, model: &str) -> RoutingDecision {
        let registry = self.registry.snapshot().await;
        let personas = self.personas.snapshot().await;
        model_routing::resolve(model, &registry, &personas)
    }

    /// Registry entries, or persona-derived models while the registry is empty.
    pub async fn list_models(&self) -> Vec<ModelEntry> {
        let registry = self.registry.snapshot().await;
        if !registry.is_empty() {
            return registry.entries().to_vec();
        }
        self.personas.snapshot().await.derived_models(unix_now())
    }

    pub async fn get_model(&self, id: &str) -> Option<ModelEntry> {
        let registry = self.registry.snapshot().await;
        if !registry.is_empty() {
            return registry.get(id).cloned();
        }
        self.personas
            .snapshot()
            .await
            .derived_models(unix_now())
            .into_iter()
            .find(|m| m.id == id)
    }

    /// Spawns the two refreshers. Callers stop them on shutdown.
    pub fn start(self: &Arc<Self>) -> Vec<PeriodicTask> {
        let registry = Arc::clone(self);
        let personas = Arc::clone(self);
        vec![
            PeriodicTask::spawn("model-registry", self.refresh_interval, move || {
                let catalog = Arc::clone(&registry);
                async move {
                    if let Err(err) = catalog.registry.refresh().await {
                        warn!("model registry refresh failed: {:#}", err);
                    }
                }
            }),
            PeriodicTask::spawn("persona-cache", self.refresh_interval, move || {
                let catalog = Arc::clone(&personas);
                async move {
                    if let Err(err) = catalog.personas.refresh().await {
                        warn!("persona refresh failed: {:#}", err);
                    }
                }
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::persona::PersonaEntry;
    use crate::model_routing::RoutingCategory;
    use crate::testutil::gateway_config;

    fn catalog() -> ModelCatalog {
        let cfg = gateway_config(&[]);
        let egress = Arc::new(EgressPool::new(&cfg).unwrap());
        ModelCatalog::new(
            &cfg,
            egress,
            Arc::new(Credential::new(None)),
            REFRESH_INTERVAL,
        )
    }

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
    fn staleness_is_three_intervals() {
        let interval = Duration::from_millis(10);
        assert!(is_stale(None, interval));
        assert!(!is_stale(Some(Instant::now()), interval));
        let old = Instant::now().checked_sub(Duration::from_millis(40));
        if old.is_some() {
            assert!(is_stale(old, interval));
        }
    }

    #[tokio::test]
    async fn empty_registry_lists_persona_models() {
        let c = catalog();
        c.personas.install(vec![persona(1, "acme", "m1")]).await;
        let models = c.list_models().await;
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "m1");
        assert_eq!(models[0].owned_by, "acme");
        assert!(c.get_model("m1").await.is_some());
        assert!(c.get_model("m2").await.is_none());
    }

    #[tokio::test]
    async fn loaded_registry_takes_precedence() {
        let c = catalog();
        c.personas.install(vec![persona(1, "acme", "m1")]).await;
        c.registry
            .install(vec![ModelEntry {
                id: "r1".into(),
                owned_by: "reg".into(),
                api_provider: None,
                category: Some(RoutingCategory::Co),
                persona_id: None,
                created: 0,
            }])
            .await;
        let ids: Vec<_> = c.list_models().await.into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["r1".to_string()]);
        assert!(c.get_model("m1").await.is_none());
        assert!(!c.resolve("r1").await.is_session());
    }

    #[tokio::test]
    async fn nothing_loaded_lists_nothing() {
        assert!(catalog().list_models().await.is_empty());
    }
}
