use crate::bridge::BridgeProvider;
#[cfg(feature = "mock")]
use crate::mock::MockProvider;
use crate::ollama::OllamaProvider;
use crate::provider::EmbeddingProvider;

/// Generates a match over all `AnyProvider` variants, binding the inner
/// provider to `$p` and evaluating `$expr` for each arm.
macro_rules! delegate_provider {
    ($self:expr, |$p:ident| $expr:expr) => {
        match $self {
            AnyProvider::Ollama($p) => $expr,
            AnyProvider::Bridge($p) => $expr,
            #[cfg(feature = "mock")]
            AnyProvider::Mock($p) => $expr,
        }
    };
}

#[derive(Debug, Clone)]
pub enum AnyProvider {
    Ollama(OllamaProvider),
    Bridge(BridgeProvider),
    #[cfg(feature = "mock")]
    Mock(MockProvider),
}

impl EmbeddingProvider for AnyProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, crate::LlmError> {
        delegate_provider!(self, |p| p.embed(texts).await)
    }

    fn model_id(&self) -> &str {
        delegate_provider!(self, |p| p.model_id())
    }

    fn name(&self) -> &str {
        delegate_provider!(self, |p| p.name())
    }
}
