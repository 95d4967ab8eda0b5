use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use deepeyes_core::DeepEyesError;

use crate::context::DurableContext;

/// A deterministic, replayable workflow definition.
///
/// `run` is re-entered from the top on every resume; side effects belong in
/// `DurableContext` steps so their recorded outputs are reused.
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    type Input: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn name(&self) -> &str;

    async fn run(
        &self,
        ctx: &mut DurableContext,
        input: Self::Input,
    ) -> Result<Self::Output, DeepEyesError>;
}
