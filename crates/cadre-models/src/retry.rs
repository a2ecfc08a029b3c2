//! Ordered-failover model client.
//!
//! [`RetryLanguageModel`] hides any number of configured backends behind one
//! call/stream API. Backends are tried strictly in the caller's preference
//! order; per-backend failures are logged and the next backend tried, and
//! only exhausting every name surfaces an error.
//!
//! Streaming failover has a subtlety: a backend can accept the connection
//! and then never produce output. To detect that before committing to a
//! backend, only the *first* stream event is awaited under a bounded
//! timeout; once a first event arrives the rest of the stream is exposed
//! as-is, with no further per-event deadline.

use crate::{ProviderConfig, ProviderFactory};
use async_trait::async_trait;
use cadre_abstraction::{
    EventStream, LanguageModel, LanguageRequest, LanguageResponse, ModelError, StreamEvent,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The fallback backend name, always present in the trying order.
pub const DEFAULT_BACKEND: &str = "default";

/// Configuration for failover behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// How long to wait for the first event of a stream before abandoning
    /// the backend.
    pub first_event_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { first_event_timeout: Duration::from_secs(20) }
    }
}

/// A language model client with ordered failover across backends.
pub struct RetryLanguageModel {
    /// Instantiated backends by configured name.
    backends: HashMap<String, Arc<dyn LanguageModel>>,
    /// Names in trying order; always ends with "default".
    names: Vec<String>,
    /// Failover configuration.
    config: RetryConfig,
}

impl RetryLanguageModel {
    /// Builds a client from a configuration map and an ordered preference
    /// list. `"default"` is appended to the order if missing. Configurations
    /// that fail to instantiate are skipped with a warning and will simply
    /// never serve a request.
    pub fn new(configs: &HashMap<String, ProviderConfig>, preferred: &[String]) -> Self {
        let mut backends: HashMap<String, Arc<dyn LanguageModel>> = HashMap::new();
        for (name, config) in configs {
            match ProviderFactory::create(config) {
                Ok(backend) => {
                    backends.insert(name.clone(), backend);
                }
                Err(e) => {
                    warn!(backend = %name, error = %e, "Skipping backend that failed to build");
                }
            }
        }
        Self::from_backends(backends, preferred)
    }

    /// Builds a client from already-instantiated backends.
    pub fn from_backends(
        backends: HashMap<String, Arc<dyn LanguageModel>>,
        preferred: &[String],
    ) -> Self {
        let mut names: Vec<String> = preferred.to_vec();
        if !names.iter().any(|n| n == DEFAULT_BACKEND) {
            names.push(DEFAULT_BACKEND.to_string());
        }
        Self { backends, names, config: RetryConfig::default() }
    }

    /// Overrides the failover configuration.
    #[must_use]
    pub fn with_config(mut self, config: RetryConfig) -> Self {
        self.config = config;
        self
    }

    /// The trying order used for every call.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    fn backend(&self, name: &str) -> Option<&Arc<dyn LanguageModel>> {
        let backend = self.backends.get(name);
        if backend.is_none() {
            warn!(backend = %name, "No configuration for backend name; skipping");
        }
        backend
    }
}

#[async_trait]
impl LanguageModel for RetryLanguageModel {
    async fn call(&self, request: &LanguageRequest) -> Result<LanguageResponse, ModelError> {
        for name in &self.names {
            if request.cancel.is_cancelled() {
                return Err(ModelError::Cancelled);
            }
            let Some(backend) = self.backend(name) else {
                continue;
            };
            match backend.call(request).await {
                Ok(response) => {
                    debug!(backend = %name, model_id = %backend.model_id(), "Model call served");
                    return Ok(response);
                }
                Err(e) => {
                    warn!(backend = %name, error = %e, "Model call failed; trying next backend");
                }
            }
        }
        Err(ModelError::Unavailable(format!(
            "all backends failed: [{}]",
            self.names.join(", ")
        )))
    }

    async fn call_stream(&self, request: &LanguageRequest) -> Result<EventStream, ModelError> {
        for name in &self.names {
            if request.cancel.is_cancelled() {
                return Err(ModelError::Cancelled);
            }
            let Some(backend) = self.backend(name) else {
                continue;
            };
            let mut stream = match backend.call_stream(request).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(backend = %name, error = %e, "Stream open failed; trying next backend");
                    continue;
                }
            };

            // Await the first event under the deadline. A hung backend is
            // abandoned here, before any event has been handed to the caller.
            let first = match tokio::time::timeout(self.config.first_event_timeout, stream.next())
                .await
            {
                Err(_) => {
                    warn!(
                        backend = %name,
                        timeout_secs = self.config.first_event_timeout.as_secs(),
                        "No first stream event within timeout; trying next backend"
                    );
                    continue;
                }
                Ok(None) => {
                    warn!(backend = %name, "Stream ended before producing any event; trying next backend");
                    continue;
                }
                Ok(Some(Err(e))) => {
                    warn!(backend = %name, error = %e, "First stream event errored; trying next backend");
                    continue;
                }
                Ok(Some(Ok(StreamEvent::Error { message }))) => {
                    warn!(backend = %name, error = %message, "First stream event signals protocol error; trying next backend");
                    continue;
                }
                Ok(Some(Ok(event))) => event,
            };

            debug!(backend = %name, model_id = %backend.model_id(), "Stream accepted");
            return Ok(Box::pin(futures::stream::iter([Ok(first)]).chain(stream)));
        }
        Err(ModelError::Unavailable(format!(
            "all backends failed: [{}]",
            self.names.join(", ")
        )))
    }

    fn model_id(&self) -> &str {
        "retry"
    }

    /// Conservative capability: true only when every configured backend
    /// accepts images in tool results, since any backend may serve a call.
    fn images_in_tool_results(&self) -> bool {
        !self.backends.is_empty()
            && self.backends.values().all(|b| b.images_in_tool_results())
    }
}
