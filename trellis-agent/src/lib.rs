//! Agent facade over the trellis graph runtime, plus the event-handler and
//! trace features.
//!
//! ```rust,no_run
//! use trellis_agent::{AgentBuilder, TraceFeature};
//! # use trellis_core::{LlmRequest, LlmResponse, ModelExecutor, TrellisError};
//! # struct Echo;
//! # #[async_trait::async_trait]
//! # impl ModelExecutor for Echo {
//! #     async fn execute(&self, _r: LlmRequest) -> Result<LlmResponse, TrellisError> {
//! #         Ok(LlmResponse::text("hi"))
//! #     }
//! # }
//!
//! # async fn demo() -> Result<(), trellis_graph::GraphError> {
//! let mut agent = AgentBuilder::single_run()?
//!     .executor(Echo)
//!     .model("demo-model")
//!     .install::<TraceFeature>(Default::default())
//!     .build()?;
//! let reply = agent.run("hello".to_string()).await?;
//! println!("{reply}");
//! # Ok(())
//! # }
//! ```

mod agent;
mod event_handler;
mod state;
mod trace;

pub use agent::{Agent, AgentBuilder};
pub use event_handler::{EventHandler, EventHandlerConfig};
pub use state::AgentState;
pub use trace::{Span, SpanKind, SpanStatus, TraceConfig, TraceFeature};
