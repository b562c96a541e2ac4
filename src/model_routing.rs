use serde::{Deserialize, Serialize};

use crate::catalog::persona::PersonaGeneration;
use crate::catalog::registry::{ModelEntry, RegistryGeneration};

/// Category a model is listed under in the registry file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoutingCategory {
    /// Routed through the persona chat-session handshake.
    #[serde(rename = "AO")]
    Ao,
    #[serde(rename = "kO")]
    Ko,
    #[serde(rename = "CO")]
    Co,
}

impl RoutingCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingCategory::Ao => "AO",
            RoutingCategory::Ko => "kO",
            RoutingCategory::Co => "CO",
        }
    }

    pub fn is_session(self) -> bool {
        matches!(self, RoutingCategory::Ao)
    }

    /// `kO` and `CO` endpoints reject requests that carry the upstream key.
    pub fn attaches_credentials(self) -> bool {
        !matches!(self, RoutingCategory::Ko | RoutingCategory::Co)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoutingDecision {
    Session {
        persona_id: u64,
        entry: ModelEntry,
    },
    Direct {
        entry: Option<ModelEntry>,
        attach_credentials: bool,
    },
}

impl RoutingDecision {
    pub fn is_session(&self) -> bool {
        matches!(self, RoutingDecision::Session { .. })
    }

    pub fn entry(&self) -> Option<&ModelEntry> {
        match self {
            RoutingDecision::Session { entry, .. } => Some(entry),
            RoutingDecision::Direct { entry, .. } => entry.as_ref(),
        }
    }

    /// Value for the `provider` query parameter of the direct endpoint.
    pub fn api_provider(&self) -> Option<&str> {
        self.entry().and_then(|e| e.api_provider.as_deref())
    }

    pub fn label(&self) -> &'static str {
        match self {
            RoutingDecision::Session { .. } => "session",
            RoutingDecision::Direct { .. } => "direct",
        }
    }
}

/// Decides the upstream dialect for `model`.
///
/// Only registry entries in the `AO` category go through a session; their
/// persona comes from the entry itself, else from the persona cache. An `AO`
/// model with no resolvable persona, and any unknown model, routes direct.
pub fn resolve(
    model: &str,
    registry: &RegistryGeneration,
    personas: &PersonaGeneration,
) -> RoutingDecision {
    let entry = registry.get(model).cloned();

    let category = entry.as_ref().and_then(|e| e.category);
    if category.is_some_and(RoutingCategory::is_session)
        && let Some(entry) = entry.clone()
    {
        let persona_id = entry
            .persona_id
            .filter(|id| *id != 0)
            .or_else(|| personas.lookup(model).map(|p| p.id));
        if let Some(persona_id) = persona_id {
            return RoutingDecision::Session { persona_id, entry };
        }
    }

    RoutingDecision::Direct {
        attach_credentials: category.is_none_or(RoutingCategory::attaches_credentials),
        entry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::persona::PersonaEntry;
    use pretty_assertions::assert_eq;

    fn entry(id: &str, category: RoutingCategory, persona_id: Option<u64>) -> ModelEntry {
        ModelEntry {
            id: id.to_string(),
            owned_by: "acme".to_string(),
            api_provider: Some("p9".to_string()),
            category: Some(category),
            persona_id,
            created: 0,
        }
    }

    fn persona(id: u64, model: &str) -> PersonaEntry {
        PersonaEntry {
            id,
            name: format!("persona-{id}"),
            description: String::new(),
            provider_override: Some("acme".to_string()),
            model_override: Some(model.to_string()),
            is_public: true,
        }
    }

    #[test]
    fn unknown_models_route_direct_with_credentials() {
        let d = resolve(
            "nope",
            &RegistryGeneration::default(),
            &PersonaGeneration::default(),
        );
        assert_eq!(
            d,
            RoutingDecision::Direct {
                entry: None,
                attach_credentials: true
            }
        );
        assert_eq!(d.api_provider(), None);
    }

    #[test]
    fn session_category_prefers_the_entry_persona() {
        let reg = RegistryGeneration::new(vec![entry("a", RoutingCategory::Ao, Some(7))]);
        let personas = PersonaGeneration::new(vec![persona(9, "a")]);
        match resolve("a", &reg, &personas) {
            RoutingDecision::Session { persona_id, .. } => assert_eq!(persona_id, 7),
            other => panic!("expected session, got {other:?}"),
        }
    }

    #[test]
    fn session_category_falls_back_to_persona_cache() {
        let reg = RegistryGeneration::new(vec![entry("a", RoutingCategory::Ao, Some(0))]);
        let personas = PersonaGeneration::new(vec![persona(9, "a")]);
        let d = resolve("a", &reg, &personas);
        assert!(d.is_session());
        assert_eq!(d.api_provider(), Some("p9"));
        match d {
            RoutingDecision::Session { persona_id, .. } => assert_eq!(persona_id, 9),
            other => panic!("expected session, got {other:?}"),
        }
    }

    #[test]
    fn session_category_without_persona_routes_direct() {
        let reg = RegistryGeneration::new(vec![entry("a", RoutingCategory::Ao, None)]);
        let d = resolve("a", &reg, &PersonaGeneration::default());
        assert_eq!(d.label(), "direct");
        assert!(matches!(
            d,
            RoutingDecision::Direct {
                attach_credentials: true,
                ..
            }
        ));
    }

    #[test]
    fn direct_categories_never_use_personas_and_drop_credentials() {
        let reg = RegistryGeneration::new(vec![
            entry("k", RoutingCategory::Ko, Some(3)),
            entry("c", RoutingCategory::Co, None),
        ]);
        let personas = PersonaGeneration::new(vec![persona(3, "k"), persona(4, "c")]);
        for model in ["k", "c"] {
            let d = resolve(model, &reg, &personas);
            assert!(matches!(
                d,
                RoutingDecision::Direct {
                    attach_credentials: false,
                    ..
                }
            ));
        }
    }

    #[test]
    fn persona_only_models_route_direct() {
        let personas = PersonaGeneration::new(vec![persona(3, "m1")]);
        let d = resolve("m1", &RegistryGeneration::default(), &personas);
        assert!(!d.is_session());
    }

    #[test]
    fn categories_round_trip_their_wire_names() {
        assert_eq!(
            serde_json::to_string(&RoutingCategory::Ko).unwrap(),
            "\"kO\""
        );
        let c: RoutingCategory = serde_json::from_str("\"AO\"").unwrap();
        assert_eq!(c, RoutingCategory::Ao);
        assert_eq!(c.as_str(), "AO");
    }
}
