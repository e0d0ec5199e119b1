//! Deployment registry: the set of deployments behind each model group
//! (spec §4.2).
//!
//! Grounded on the teacher's `LLMRouter` (`src/llm/router.rs`), which keeps
//! providers in a `HashMap<LLMProviderType, Box<dyn LLMProviderClient>>`
//! built once at construction. This module generalizes that to
//! many-deployments-per-model-group with live add/update/remove, since the
//! spec treats `add_deployment` as a hot-path admin operation rather than
//! constructor-time wiring.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::config::{DeploymentConfigEntry, DeploymentModelInfo, DeploymentParams, DeploymentParamsPatch};
use crate::error::{ErrorContext, RouterError, RouterResult};
use crate::providers::ProviderKind;

#[derive(Debug, Clone)]
pub struct Deployment {
    pub id: String,
    pub model_group: String,
    pub params: DeploymentParams,
    pub model_info: DeploymentModelInfo,
}

impl Deployment {
    fn from_entry(entry: DeploymentConfigEntry) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            model_group: entry.model_name,
            params: entry.litellm_params,
            model_info: entry.model_info,
        }
    }
}

/// Context-window size lookups the registry falls back to when a
/// deployment's own `model_info` doesn't carry one — primarily the Azure
/// case where the deployment name is a user-chosen alias that tells you
/// nothing about the underlying model (spec §4.2 "Azure base_model
/// fallback").
pub trait ModelInfoLookup: Send + Sync {
    fn max_input_tokens(&self, canonical_model: &str) -> Option<u32>;

    /// Pricing/context-window metadata for a canonical model name, if
    /// known. `None` signals "unknown model" to `resolve_model_info`,
    /// which turns that into a sentinel record plus a DEBUG diagnostic
    /// rather than an error (spec §4.2 "Azure deployments without
    /// base_model are common and legitimate").
    fn model_info(&self, canonical_model: &str) -> Option<ResolvedModelInfo> {
        self.max_input_tokens(canonical_model)
            .map(|max_input_tokens| ResolvedModelInfo {
                canonical_model: canonical_model.to_string(),
                max_input_tokens: Some(max_input_tokens),
                max_output_tokens: None,
                input_cost_per_token: None,
                output_cost_per_token: None,
            })
    }
}

/// A lookup table with nothing in it; used where no model metadata source
/// has been wired in yet.
#[derive(Default)]
pub struct EmptyModelInfoLookup;

impl ModelInfoLookup for EmptyModelInfoLookup {
    fn max_input_tokens(&self, _canonical_model: &str) -> Option<u32> {
        None
    }
}

/// Pricing/context-window metadata for one canonical model (spec §4.2
/// `resolve_model_info`).
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModelInfo {
    pub canonical_model: String,
    pub max_input_tokens: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub input_cost_per_token: Option<f64>,
    pub output_cost_per_token: Option<f64>,
}

impl ResolvedModelInfo {
    /// The "unknown model" sentinel spec §4.2 requires when neither
    /// `base_model` nor `upstream_model` resolves to known metadata. Never
    /// an error — logged at DEBUG only.
    fn unknown(canonical_model: &str) -> Self {
        Self {
            canonical_model: canonical_model.to_string(),
            max_input_tokens: None,
            max_output_tokens: None,
            input_cost_per_token: None,
            output_cost_per_token: None,
        }
    }
}

pub struct DeploymentRegistry {
    deployments: DashMap<String, Deployment>,
    /// `model_group -> [deployment_id]`, maintained alongside `deployments`
    /// so `list_group` doesn't scan the whole map on every call.
    groups: DashMap<String, Vec<String>>,
    model_info_lookup: Arc<dyn ModelInfoLookup>,
}

impl DeploymentRegistry {
    pub fn new(model_info_lookup: Arc<dyn ModelInfoLookup>) -> Self {
        Self {
            deployments: DashMap::new(),
            groups: DashMap::new(),
            model_info_lookup,
        }
    }

    pub fn with_empty_model_info_lookup() -> Self {
        Self::new(Arc::new(EmptyModelInfoLookup))
    }

    pub fn add_deployment(&self, entry: DeploymentConfigEntry) -> Deployment {
        let deployment = Deployment::from_entry(entry);
        self.groups
            .entry(deployment.model_group.clone())
            .or_default()
            .push(deployment.id.clone());
        self.deployments.insert(deployment.id.clone(), deployment.clone());
        deployment
    }

    /// Applies a patch to an existing deployment's `litellm_params`.
    /// `provider` and `upstream_model` can never change here — they're
    /// immutable post-creation (spec §3) — because `DeploymentParamsPatch`
    /// has no field for either (spec §4.2 "patch may update credentials
    /// and limits only").
    pub fn update_deployment(&self, id: &str, patch: DeploymentParamsPatch) -> RouterResult<()> {
        let mut entry = self.deployments.get_mut(id).ok_or_else(|| {
            RouterError::NotFound {
                message: format!("no deployment with id {id}"),
                context: ErrorContext::default(),
            }
        })?;
        entry.params.apply_patch(patch);
        Ok(())
    }

    pub fn remove_deployment(&self, id: &str) -> RouterResult<()> {
        let (_, deployment) = self.deployments.remove(id).ok_or_else(|| RouterError::NotFound {
            message: format!("no deployment with id {id}"),
            context: ErrorContext::default(),
        })?;
        if let Some(mut ids) = self.groups.get_mut(&deployment.model_group) {
            ids.retain(|existing| existing != id);
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Deployment> {
        self.deployments.get(id).map(|e| e.clone())
    }

    pub fn list_group(&self, model_group: &str) -> Vec<Deployment> {
        let ids = self
            .groups
            .get(model_group)
            .map(|e| e.clone())
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.get(&id)).collect()
    }

    pub fn model_groups(&self) -> Vec<String> {
        self.groups.iter().map(|e| e.key().clone()).collect()
    }

    /// Resolves the effective max-input-tokens for a deployment, falling
    /// back to `model_info.base_model`'s known context window when the
    /// deployment itself doesn't declare one (spec §4.2).
    pub fn resolve_max_input_tokens(&self, deployment: &Deployment) -> Option<u32> {
        if let Some(explicit) = deployment.params.max_input_tokens {
            return Some(explicit);
        }
        let lookup_key = deployment
            .model_info
            .base_model
            .as_deref()
            .unwrap_or(&deployment.params.upstream_model);
        self.model_info_lookup.max_input_tokens(lookup_key)
    }

    /// Resolves pricing/context-window metadata for a deployment (spec
    /// §4.2 `resolve_model_info`): `base_model` wins when set, otherwise
    /// the deployment's own `upstream_model`. An unknown model is never an
    /// error — it returns the sentinel record and logs DEBUG, since Azure
    /// deployments without `base_model` are common and legitimate (spec
    /// §7 "log level discipline").
    pub fn resolve_model_info(&self, deployment: &Deployment) -> ResolvedModelInfo {
        let lookup_key = deployment
            .model_info
            .base_model
            .as_deref()
            .unwrap_or(&deployment.params.upstream_model);

        match self.model_info_lookup.model_info(lookup_key) {
            Some(info) => info,
            None => {
                debug!(
                    deployment_id = %deployment.id,
                    lookup_key,
                    "no known pricing/context-window metadata for this model; using unknown sentinel"
                );
                ResolvedModelInfo::unknown(lookup_key)
            }
        }
    }

    /// Every currently-configured provider kind, for adapter-registry
    /// sanity checks at startup.
    pub fn provider_kinds_in_use(&self) -> HashMap<ProviderKind, usize> {
        let mut counts = HashMap::new();
        for entry in self.deployments.iter() {
            *counts.entry(entry.params.provider.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeploymentParams;

    fn entry(model_name: &str, provider: ProviderKind) -> DeploymentConfigEntry {
        DeploymentConfigEntry {
            model_name: model_name.to_string(),
            litellm_params: DeploymentParams {
                provider,
                upstream_model: "gpt-4".to_string(),
                ..DeploymentParams::default()
            },
            model_info: DeploymentModelInfo::default(),
        }
    }

    #[test]
    fn list_group_returns_only_matching_model_group() {
        let registry = DeploymentRegistry::with_empty_model_info_lookup();
        registry.add_deployment(entry("gpt-4", ProviderKind::OpenAI));
        registry.add_deployment(entry("claude-3", ProviderKind::Anthropic));
        assert_eq!(registry.list_group("gpt-4").len(), 1);
        assert_eq!(registry.list_group("claude-3").len(), 1);
        assert_eq!(registry.list_group("nonexistent").len(), 0);
    }

    #[test]
    fn remove_deployment_drops_it_from_its_group() {
        let registry = DeploymentRegistry::with_empty_model_info_lookup();
        let d = registry.add_deployment(entry("gpt-4", ProviderKind::OpenAI));
        registry.remove_deployment(&d.id).unwrap();
        assert_eq!(registry.list_group("gpt-4").len(), 0);
        assert!(registry.get(&d.id).is_none());
    }

    #[test]
    fn explicit_max_input_tokens_wins_over_lookup() {
        let registry = DeploymentRegistry::with_empty_model_info_lookup();
        let mut cfg = entry("gpt-4", ProviderKind::OpenAI);
        cfg.litellm_params.max_input_tokens = Some(8192);
        let d = registry.add_deployment(cfg);
        assert_eq!(registry.resolve_max_input_tokens(&d), Some(8192));
    }

    #[test]
    fn update_deployment_preserves_provider_and_upstream_model() {
        let registry = DeploymentRegistry::with_empty_model_info_lookup();
        let d = registry.add_deployment(entry("gpt-4", ProviderKind::OpenAI));
        registry
            .update_deployment(
                &d.id,
                DeploymentParamsPatch {
                    rpm: Some(42),
                    ..Default::default()
                },
            )
            .unwrap();
        let updated = registry.get(&d.id).unwrap();
        assert_eq!(updated.params.provider, ProviderKind::OpenAI);
        assert_eq!(updated.params.upstream_model, "gpt-4");
        assert_eq!(updated.params.rpm, Some(42));
    }

    #[test]
    fn resolve_model_info_falls_back_to_base_model_then_unknown_sentinel() {
        struct OnlyKnowsGpt4;
        impl ModelInfoLookup for OnlyKnowsGpt4 {
            fn max_input_tokens(&self, canonical_model: &str) -> Option<u32> {
                (canonical_model == "gpt-4").then_some(8192)
            }
        }

        let registry = DeploymentRegistry::new(Arc::new(OnlyKnowsGpt4));
        let mut azure_cfg = entry("azure-gpt4", ProviderKind::Azure);
        azure_cfg.model_info.base_model = Some("gpt-4".to_string());
        azure_cfg.litellm_params.upstream_model = "my-deployment-alias".to_string();
        let azure_deployment = registry.add_deployment(azure_cfg);
        let info = registry.resolve_model_info(&azure_deployment);
        assert_eq!(info.canonical_model, "gpt-4");
        assert_eq!(info.max_input_tokens, Some(8192));

        let unmapped = entry("mystery-model", ProviderKind::Azure);
        let unmapped_deployment = registry.add_deployment(unmapped);
        let info = registry.resolve_model_info(&unmapped_deployment);
        assert_eq!(info.max_input_tokens, None);
    }
}
