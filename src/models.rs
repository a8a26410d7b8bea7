//! Model-name resolution and the upstream model list.

use crate::config::GatewayConfig;
use crate::translate::gemini_types::ModelsResponse;
use crate::translate::openai_types::{ModelEntry, ModelList};

const UPSTREAM_FAMILIES: [&str; 3] = ["gemini-", "gemma-", "learnlm-"];

/// Resolve the model a client asked for into an upstream model name.
///
/// Configured aliases win; a `models/` prefix is stripped; known upstream
/// families pass through; anything else falls back to the default model.
pub fn resolve_model(config: &GatewayConfig, requested: Option<&str>) -> String {
    let Some(requested) = requested.filter(|m| !m.is_empty()) else {
        return config.default_model.clone();
    };

    if let Some(alias) = config.models.get(requested) {
        tracing::debug!(from = %requested, to = %alias, "Model alias");
        return alias.clone();
    }

    let name = requested.strip_prefix("models/").unwrap_or(requested);
    if UPSTREAM_FAMILIES.iter().any(|f| name.starts_with(f)) {
        name.to_string()
    } else {
        tracing::debug!(requested = %requested, fallback = %config.default_model, "Unknown model, using default");
        config.default_model.clone()
    }
}

pub fn to_model_list(resp: ModelsResponse) -> ModelList {
    let data = resp
        .models
        .into_iter()
        .map(|m| ModelEntry {
            id: m.name.strip_prefix("models/").unwrap_or(&m.name).to_string(),
            object: "model".to_string(),
            created: 0,
            owned_by: String::new(),
        })
        .collect();

    ModelList {
        object: "list".to_string(),
        data,
    }
}
