//! Model Selection
//!
//! Which model a send goes to, and the credentials that travel with it.

use serde::{Deserialize, Serialize};

use crate::backend::{ChatRequest, ModelCatalog, ModelSource};

/// The user's current model choice
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    /// Where the model runs
    pub source: ModelSource,
    /// Selected model; `None` blocks sending
    pub model_name: Option<String>,
    /// SiliconFlow API key
    pub api_key: Option<String>,
    /// Graph database password
    pub graph_password: Option<String>,
}

impl ModelSelection {
    /// Selection of a specific model
    pub fn new(source: ModelSource, model_name: impl Into<String>) -> Self {
        Self {
            source,
            model_name: Some(model_name.into()),
            ..Self::default()
        }
    }

    /// Whether a send can go out
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.model_name.as_deref().is_some_and(|name| !name.is_empty())
    }

    /// Fill in a model from a freshly fetched catalog
    ///
    /// Keeps an existing choice. Otherwise picks the first local model, then
    /// the first SiliconFlow model.
    pub fn apply_catalog(&mut self, catalog: &ModelCatalog) {
        if self.is_ready() {
            return;
        }
        if let Some(first) = catalog.local.first() {
            self.source = ModelSource::Local;
            self.model_name = Some(first.clone());
        } else if let Some(first) = catalog.siliconflow.first() {
            self.source = ModelSource::Siliconflow;
            self.model_name = Some(first.clone());
        }
    }

    /// Switch source and select its first model (or none)
    pub fn set_source(&mut self, source: ModelSource, catalog: &ModelCatalog) {
        self.source = source;
        self.model_name = catalog.models(source).first().cloned();
    }

    /// Build the request for a query, if a model is selected
    #[must_use]
    pub fn request_for(&self, query: &str) -> Option<ChatRequest> {
        let model_name = self.model_name.as_deref().filter(|name| !name.is_empty())?;
        Some(
            ChatRequest::new(query, self.source, model_name)
                .with_api_key(self.api_key.as_deref())
                .with_graph_password(self.graph_password.as_deref()),
        )
    }
}
