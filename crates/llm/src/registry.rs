//! Cache of live provider sessions keyed by endpoint descriptor.

use std::sync::Arc;

use async_openai::config::{AzureConfig, OpenAIConfig};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::anthropic::AnthropicClient;
use crate::bedrock::BedrockClient;
use crate::config::{EndpointDescriptor, ProviderKind};
use crate::openai::OpenAiBackend;
use crate::provider::ChatProvider;

/// Long-lived network client for one endpoint.
pub enum ProviderSession {
    OpenAi(OpenAiBackend<OpenAIConfig>),
    Azure(OpenAiBackend<AzureConfig>),
    Anthropic(AnthropicClient),
    Bedrock(BedrockClient),
}

impl ProviderSession {
    /// Builds the client matching the descriptor's provider kind.
    ///
    /// No network I/O happens here; credentials are checked on first use.
    pub fn connect(descriptor: &EndpointDescriptor) -> Self {
        let base_url = descriptor.base_url.as_deref();
        match descriptor.provider_kind {
            ProviderKind::OpenAi => {
                ProviderSession::OpenAi(OpenAiBackend::new(&descriptor.api_key, base_url))
            }
            ProviderKind::Azure => ProviderSession::Azure(OpenAiBackend::azure(
                &descriptor.api_key,
                base_url,
                &descriptor.model,
                descriptor.api_version.as_deref(),
            )),
            ProviderKind::Anthropic => {
                ProviderSession::Anthropic(AnthropicClient::new(descriptor.api_key.clone(), base_url))
            }
            ProviderKind::Bedrock => ProviderSession::Bedrock(BedrockClient::new(base_url)),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderSession::OpenAi(_) => ProviderKind::OpenAi,
            ProviderSession::Azure(_) => ProviderKind::Azure,
            ProviderSession::Anthropic(_) => ProviderKind::Anthropic,
            ProviderSession::Bedrock(_) => ProviderKind::Bedrock,
        }
    }

    /// The wire backend behind this session.
    pub fn provider(&self) -> &dyn ChatProvider {
        match self {
            ProviderSession::OpenAi(backend) => backend,
            ProviderSession::Azure(backend) => backend,
            ProviderSession::Anthropic(client) => client,
            ProviderSession::Bedrock(client) => client,
        }
    }
}

impl std::fmt::Debug for ProviderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ProviderSession").field(&self.kind()).finish()
    }
}

/// Shares one [`ProviderSession`] per distinct descriptor.
///
/// Sessions are never evicted.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    sessions: DashMap<EndpointDescriptor, Arc<ProviderSession>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached session for `descriptor`, creating it on first use.
    ///
    /// Lookup and insertion happen under the shard lock, so concurrent
    /// callers with equal descriptors always receive the same session.
    pub fn get_or_create(&self, descriptor: &EndpointDescriptor) -> Arc<ProviderSession> {
        if let Some(existing) = self.sessions.get(descriptor) {
            debug!(
                kind = %descriptor.provider_kind,
                model = %descriptor.model,
                "Reusing provider session"
            );
            return Arc::clone(existing.value());
        }

        let entry = self.sessions.entry(descriptor.clone()).or_insert_with(|| {
            info!(
                kind = %descriptor.provider_kind,
                model = %descriptor.model,
                base_url = ?descriptor.base_url,
                "Creating provider session"
            );
            Arc::new(ProviderSession::connect(descriptor))
        });
        Arc::clone(entry.value())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
