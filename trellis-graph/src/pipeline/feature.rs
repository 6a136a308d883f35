use std::sync::Arc;

use crate::pipeline::PipelineBuilder;
use crate::GraphError;

/// A plugin installed into the pipeline when an agent is built.
///
/// `install` receives the immutable configuration and registers the
/// interceptors the feature needs. The returned instance is what
/// [`crate::AgentContext::feature`] hands back later, so any operations the
/// feature exposes (creating checkpoints, reading collected spans) live on
/// `Self`.
pub trait Feature: Send + Sync + Sized + 'static {
    type Config: Default + Send;

    /// Stable identifier used in error messages and duplicate detection.
    const NAME: &'static str;

    fn install(config: Self::Config, pipeline: &mut PipelineBuilder)
        -> Result<Arc<Self>, GraphError>;
}
