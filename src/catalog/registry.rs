use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{info, warn};

use crate::model_routing::RoutingCategory;
use crate::openai::{ModelObject, unix_now};

use super::is_stale;

/// Routing metadata for one model id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub owned_by: String,
    /// `provider` query value for the direct endpoint.
    pub api_provider: Option<String>,
    /// `None` for models derived from personas rather than the registry file.
    pub category: Option<RoutingCategory>,
    pub persona_id: Option<u64>,
    pub created: i64,
}

impl ModelEntry {
    pub fn to_object(&self) -> ModelObject {
        ModelObject {
            id: self.id.clone(),
            object: "model",
            created: self.created,
            owned_by: self.owned_by.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawModel {
    id: String,
    #[serde(default)]
    provider: String,
    #[serde(default, rename = "apiProvider")]
    api_provider: String,
    #[serde(default)]
    persona_id: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelsFile {
    #[serde(default, rename = "AO")]
    ao: Vec<RawModel>,
    #[serde(default, rename = "kO")]
    ko: Vec<RawModel>,
    #[serde(default, rename = "CO")]
    co: Vec<RawModel>,
}

/// Parses the grouped models file; entries keep file order, `AO` first.
pub fn parse_models(raw: &str) -> Result<Vec<ModelEntry>> {
    let file: ModelsFile = serde_json::from_str(raw).context("invalid models json")?;
    let created = unix_now();
    let groups = [
        (RoutingCategory::Ao, file.ao),
        (RoutingCategory::Ko, file.ko),
        (RoutingCategory::Co, file.co),
    ];
    Ok(groups
        .into_iter()
        .flat_map(|(category, items)| {
            items.into_iter().filter(|m| !m.id.is_empty()).map(move |m| ModelEntry {
                id: m.id,
                owned_by: m.provider,
                api_provider: Some(m.api_provider).filter(|s| !s.is_empty()),
                category: Some(category),
                persona_id: m.persona_id.filter(|id| *id != 0),
                created,
            })
        })
        .collect())
}

/// One immutable load of the registry.
#[derive(Debug, Default)]
pub struct RegistryGeneration {
    entries: Vec<ModelEntry>,
    by_id: HashMap<String, usize>,
    loaded_at: Option<Instant>,
}

impl RegistryGeneration {
    pub fn new(entries: Vec<ModelEntry>) -> Self {
        let mut by_id = HashMap::with_capacity(entries.len());
        for (idx, e) in entries.iter().enumerate() {
            // 重复 id 时保留第一个
            by_id.entry(e.id.clone()).or_insert(idx);
        }
        Self {
            entries,
            by_id,
            loaded_at: Some(Instant::now()),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ModelEntry> {
        self.by_id.get(id).map(|&idx| &self.entries[idx])
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn loaded_at(&self) -> Option<Instant> {
        self.loaded_at
    }
}

pub struct ModelRegistry {
    path: PathBuf,
    refresh_interval: Duration,
    current: AsyncRwLock<Arc<RegistryGeneration>>,
    consecutive_failures: AtomicU32,
}

impl ModelRegistry {
    pub fn new(path: impl Into<PathBuf>, refresh_interval: Duration) -> Self {
        Self {
            path: path.into(),
            refresh_interval,
            current: AsyncRwLock::new(Arc::new(RegistryGeneration::default())),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub async fn snapshot(&self) -> Arc<RegistryGeneration> {
        self.current.read().await.clone()
    }

    pub async fn install(&self, entries: Vec<ModelEntry>) {
        *self.current.write().await = Arc::new(RegistryGeneration::new(entries));
    }

    /// Reloads the file. On failure the previous generation stays in place.
    pub async fn refresh(&self) -> Result<usize> {
        let loaded = async {
            let raw = tokio::fs::read_to_string(&self.path)
                .await
                .with_context(|| format!("read {}", self.path.display()))?;
            parse_models(&raw)
        }
        .await;

        match loaded {
            Ok(entries) => {
                let n = entries.len();
                self.install(entries).await;
                self.consecutive_failures.store(0, Ordering::Relaxed);
                info!("loaded {} models from {}", n, self.path.display());
                Ok(n)
            }
            Err(err) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let snap = self.snapshot().await;
                if snap.loaded_at().is_some()
                    && is_stale(snap.loaded_at(), self.refresh_interval)
                {
                    warn!(
                        "model registry is stale: {} consecutive refresh failures, still serving {} models",
                        failures,
                        snap.entries().len()
                    );
                }
                Err(err)
            }
        }
    }
}
