/// Something that turns text into embedding vectors for one model.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed every text in `texts`, returning one vector per input in order.
    ///
    /// An empty result means the provider produced nothing for this call
    /// (timeout, cancellation) and is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider fails to communicate or the response is invalid.
    fn embed(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, crate::LlmError>> + Send;

    /// Identifier of the embedding model. Different identifiers never share vectors.
    fn model_id(&self) -> &str;

    fn name(&self) -> &str;
}
