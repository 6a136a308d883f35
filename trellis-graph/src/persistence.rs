//! Checkpointing and rollback as a pipeline feature.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use trellis_core::{Message, ToolCall, Value};
use uuid::Uuid;

use crate::checkpoint::{
    Checkpoint, CheckpointFilter, CheckpointStorage, InMemoryCheckpointStorage,
};
use crate::graph::{FINISH, START};
use crate::pipeline::{
    Feature, NodeCompleted, NodeFailed, NodeStarting, PipelineBuilder, RunStarting,
    ToolCallSucceeded,
};
use crate::rollback::{calls_after, result_ids};
use crate::{AgentContext, GraphError, ResumeTarget, RollbackToolRegistry, StorageKey};

/// State as it stood when each in-flight node started, keyed by step id.
const PRE_NODE_STATE: StorageKey<HashMap<Uuid, PreNodeState>> =
    StorageKey::new("trellis.persistence.pre_node_state");

/// Tool calls executed on this context and not reverted since, oldest first.
/// Kept only when rollback tools are configured.
const EXECUTED_CALLS: StorageKey<Vec<ToolCall>> =
    StorageKey::new("trellis.persistence.executed_calls");

#[derive(Clone, Debug, Default)]
struct PreNodeState {
    history: Vec<Message>,
    executed: Vec<String>,
}

impl PreNodeState {
    fn capture(ctx: &AgentContext) -> Self {
        Self {
            history: ctx.history().to_vec(),
            executed: executed_ids(ctx),
        }
    }
}

fn executed_ids(ctx: &AgentContext) -> Vec<String> {
    ctx.storage()
        .get_typed(&EXECUTED_CALLS)
        .map(|calls| calls.iter().map(|call| call.id.clone()).collect())
        .unwrap_or_default()
}

/// Everything a checkpoint records besides its id, time and version.
struct Snapshot {
    target: ResumeTarget,
    input_type: String,
    state: PreNodeState,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RollbackStrategy {
    /// Restore history and continue traversal at the recorded node.
    #[default]
    Full,
    /// Restore history only; the next run starts from the beginning.
    HistoryOnly,
}

#[derive(Clone)]
pub struct PersistenceConfig {
    pub storage: Arc<dyn CheckpointStorage>,
    pub enable_automatic_persistence: bool,
    pub rollback_strategy: RollbackStrategy,
    pub rollback_tools: RollbackToolRegistry,
    pub restore_latest_on_start: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            storage: Arc::new(InMemoryCheckpointStorage::new()),
            enable_automatic_persistence: false,
            rollback_strategy: RollbackStrategy::Full,
            rollback_tools: RollbackToolRegistry::default(),
            restore_latest_on_start: false,
        }
    }
}

impl std::fmt::Debug for PersistenceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceConfig")
            .field(
                "enable_automatic_persistence",
                &self.enable_automatic_persistence,
            )
            .field("rollback_strategy", &self.rollback_strategy)
            .field("rollback_tools", &self.rollback_tools)
            .field("restore_latest_on_start", &self.restore_latest_on_start)
            .finish()
    }
}

impl PersistenceConfig {
    pub fn with_storage(mut self, storage: impl CheckpointStorage + 'static) -> Self {
        self.storage = Arc::new(storage);
        self
    }

    pub fn automatic(mut self) -> Self {
        self.enable_automatic_persistence = true;
        self
    }

    pub fn with_strategy(mut self, strategy: RollbackStrategy) -> Self {
        self.rollback_strategy = strategy;
        self
    }

    pub fn with_rollback_tools(mut self, tools: RollbackToolRegistry) -> Self {
        self.rollback_tools = tools;
        self
    }

    pub fn restore_latest_on_start(mut self) -> Self {
        self.restore_latest_on_start = true;
        self
    }
}

/// Saves snapshots of a run and restores them, reverting tool side effects
/// through the configured inverse tools.
///
/// A checkpoint points at a node together with the input it received and the
/// history as it stood before that node ran, so a full restore re-executes
/// the node.
pub struct Persistence {
    storage: Arc<dyn CheckpointStorage>,
    strategy: RollbackStrategy,
    rollback_tools: RollbackToolRegistry,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("strategy", &self.strategy)
            .field("rollback_tools", &self.rollback_tools)
            .finish()
    }
}

impl Feature for Persistence {
    type Config = PersistenceConfig;
    const NAME: &'static str = "persistence";

    fn install(
        config: PersistenceConfig,
        pipeline: &mut PipelineBuilder,
    ) -> Result<Arc<Self>, GraphError> {
        config.rollback_tools.validate(pipeline.tools())?;
        let me = Arc::new(Self {
            storage: config.storage,
            strategy: config.rollback_strategy,
            rollback_tools: config.rollback_tools,
        });

        pipeline.intercept::<RunStarting, _>(Self::NAME, |_event, ctx| {
            Box::pin(async move {
                ctx.storage_mut().set_typed(&PRE_NODE_STATE, HashMap::new());
                Ok(())
            })
        });
        if config.restore_latest_on_start {
            let feature = Arc::clone(&me);
            pipeline.intercept::<RunStarting, _>(Self::NAME, move |_event, ctx| {
                let feature = Arc::clone(&feature);
                Box::pin(async move {
                    if let Some(checkpoint) = feature.rollback_to_latest(ctx).await? {
                        tracing::info!(
                            run_id = %ctx.run_id(),
                            checkpoint_id = %checkpoint.checkpoint_id,
                            "restored latest checkpoint on start"
                        );
                    }
                    Ok(())
                })
            });
        }

        pipeline.intercept::<NodeStarting, _>(Self::NAME, |event, ctx| {
            let step_id = event.step_id;
            let skip = is_boundary(&event.node);
            Box::pin(async move {
                if !skip {
                    let state = PreNodeState::capture(ctx);
                    with_stash(ctx, |stash| stash.insert(step_id, state));
                }
                Ok(())
            })
        });
        pipeline.intercept::<NodeFailed, _>(Self::NAME, |event, ctx| {
            let step_id = event.step_id;
            Box::pin(async move {
                with_stash(ctx, |stash| stash.remove(&step_id));
                Ok(())
            })
        });

        if !me.rollback_tools.is_empty() {
            pipeline.intercept::<ToolCallSucceeded, _>(Self::NAME, |event, ctx| {
                let call = event.call.clone();
                Box::pin(async move {
                    let storage = ctx.storage_mut();
                    let mut executed = storage.remove_typed(&EXECUTED_CALLS).unwrap_or_default();
                    executed.push(call);
                    storage.set_typed(&EXECUTED_CALLS, executed);
                    Ok(())
                })
            });
        }

        let feature = Arc::clone(&me);
        let automatic = config.enable_automatic_persistence;
        pipeline.intercept::<NodeCompleted, _>(Self::NAME, move |event, ctx| {
            let feature = Arc::clone(&feature);
            Box::pin(async move {
                let before = with_stash(ctx, |stash| stash.remove(&event.step_id));
                if !automatic || is_boundary(&event.node) || ctx.pending_resume().is_some() {
                    return Ok(());
                }
                let snapshot = Snapshot {
                    target: ResumeTarget {
                        node_path: event.node_path.clone(),
                        subgraph_inputs: ctx.position().subgraph_inputs(),
                        input: event.input.clone(),
                    },
                    input_type: event.input_type.clone(),
                    state: before.unwrap_or_else(|| PreNodeState::capture(ctx)),
                };
                feature.save(ctx.run_id(), snapshot).await?;
                Ok(())
            })
        });

        Ok(me)
    }
}

fn is_boundary(node: &str) -> bool {
    node == START || node == FINISH
}

fn with_stash<R>(
    ctx: &mut AgentContext,
    f: impl FnOnce(&mut HashMap<Uuid, PreNodeState>) -> R,
) -> R {
    let mut stash = ctx
        .storage_mut()
        .remove_typed(&PRE_NODE_STATE)
        .unwrap_or_default();
    let result = f(&mut stash);
    ctx.storage_mut().set_typed(&PRE_NODE_STATE, stash);
    result
}

impl Persistence {
    pub fn storage(&self) -> &Arc<dyn CheckpointStorage> {
        &self.storage
    }

    pub fn strategy(&self) -> RollbackStrategy {
        self.strategy
    }

    /// Snapshots the current position. Inside a node the snapshot points at
    /// that node with the history from before it started.
    pub async fn create_checkpoint(
        &self,
        ctx: &mut AgentContext,
    ) -> Result<Checkpoint, GraphError> {
        let position = ctx.position();
        let (target, input_type) = match (position.node(), position.last_input()) {
            (Some(_), Some((input, input_type))) => (
                ResumeTarget {
                    node_path: position.node_path(),
                    subgraph_inputs: position.subgraph_inputs(),
                    input: input.clone(),
                },
                input_type.to_string(),
            ),
            _ => match position.last_completed() {
                Some(snapshot) => (
                    ResumeTarget {
                        node_path: snapshot.node_path.clone(),
                        subgraph_inputs: snapshot.subgraph_inputs.clone(),
                        input: snapshot.last_input.clone(),
                    },
                    snapshot.last_input_type.clone(),
                ),
                None => {
                    return Err(GraphError::Checkpoint(
                        "no execution position to checkpoint; the run has not started".into(),
                    ))
                }
            },
        };
        let step_id = position.step_id();
        let state = with_stash(ctx, |stash| stash.get(&step_id).cloned())
            .unwrap_or_else(|| PreNodeState::capture(ctx));
        let snapshot = Snapshot {
            target,
            input_type,
            state,
        };
        self.save(ctx.run_id(), snapshot).await
    }

    /// Snapshots the current history with an explicit resume point at a
    /// top-level node. Nested points go through
    /// [`Persistence::create_checkpoint_within`].
    pub async fn create_checkpoint_at(
        &self,
        ctx: &AgentContext,
        node_path: Vec<String>,
        input: Value,
        input_type: impl Into<String>,
    ) -> Result<Checkpoint, GraphError> {
        let target = ResumeTarget {
            node_path,
            subgraph_inputs: Vec::new(),
            input,
        };
        self.create_checkpoint_within(ctx, target, input_type).await
    }

    /// Snapshots the current history with an explicit resume point, which
    /// must carry one input per enclosing subgraph.
    pub async fn create_checkpoint_within(
        &self,
        ctx: &AgentContext,
        target: ResumeTarget,
        input_type: impl Into<String>,
    ) -> Result<Checkpoint, GraphError> {
        if target.subgraph_inputs.len() + 1 != target.node_path.len() {
            return Err(GraphError::Checkpoint(format!(
                "resume point {:?} needs {} subgraph input(s), got {}",
                target.node_path,
                target.node_path.len().saturating_sub(1),
                target.subgraph_inputs.len()
            )));
        }
        let snapshot = Snapshot {
            target,
            input_type: input_type.into(),
            state: PreNodeState::capture(ctx),
        };
        self.save(ctx.run_id(), snapshot).await
    }

    pub async fn checkpoints(&self, run_id: &str) -> Result<Vec<Checkpoint>, GraphError> {
        self.storage
            .get_checkpoints(run_id, &CheckpointFilter::all())
            .await
    }

    pub async fn checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, GraphError> {
        Ok(self
            .checkpoints(run_id)
            .await?
            .into_iter()
            .find(|checkpoint| checkpoint.checkpoint_id == checkpoint_id))
    }

    pub async fn latest_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>, GraphError> {
        self.storage
            .get_latest_checkpoint(run_id, &CheckpointFilter::all())
            .await
    }

    pub async fn delete_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<bool, GraphError> {
        self.storage.delete_checkpoint(run_id, checkpoint_id).await
    }

    /// Restores the checkpoint with `checkpoint_id` of the context's run.
    pub async fn rollback_to_checkpoint(
        &self,
        ctx: &mut AgentContext,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, GraphError> {
        let checkpoint = self
            .checkpoint(ctx.run_id(), checkpoint_id)
            .await?
            .ok_or_else(|| {
                GraphError::Restore(format!(
                    "checkpoint '{checkpoint_id}' not found for run '{}'",
                    ctx.run_id()
                ))
            })?;
        self.restore(ctx, &checkpoint).await?;
        Ok(checkpoint)
    }

    /// Restores the newest checkpoint, if the run has any.
    pub async fn rollback_to_latest(
        &self,
        ctx: &mut AgentContext,
    ) -> Result<Option<Checkpoint>, GraphError> {
        let Some(checkpoint) = self.latest_checkpoint(ctx.run_id()).await? else {
            return Ok(None);
        };
        self.restore(ctx, &checkpoint).await?;
        Ok(Some(checkpoint))
    }

    async fn restore(
        &self,
        ctx: &mut AgentContext,
        checkpoint: &Checkpoint,
    ) -> Result<(), GraphError> {
        let enclosing = checkpoint.node_path.len().saturating_sub(1);
        if self.strategy == RollbackStrategy::Full && checkpoint.subgraph_inputs.len() != enclosing
        {
            return Err(GraphError::Restore(format!(
                "checkpoint '{}' records {} of the {enclosing} subgraph input(s) needed to resume at {:?}",
                checkpoint.checkpoint_id,
                checkpoint.subgraph_inputs.len(),
                checkpoint.node_path
            )));
        }
        if !self.rollback_tools.is_empty() {
            let executed = calls_to_revert(ctx, checkpoint)?;
            let steps = self.rollback_tools.plan(&executed)?;
            for step in steps {
                tracing::warn!(
                    tool = %step.forward.name,
                    call_id = %step.forward.id,
                    inverse = %step.inverse.name(),
                    "reverting tool call"
                );
                step.inverse
                    .execute(step.forward.args.clone())
                    .await
                    .map_err(|err| {
                        GraphError::Restore(format!(
                            "inverse tool '{}' failed for call {}: {err}",
                            step.inverse.name(),
                            step.forward.id
                        ))
                    })?;
                if let Some(calls) = ctx.storage_mut().get_typed_mut(&EXECUTED_CALLS) {
                    calls.retain(|call| call.id != step.forward.id);
                }
            }
        }

        ctx.history_mut().replace(checkpoint.history.clone());
        with_stash(ctx, HashMap::clear);
        match self.strategy {
            RollbackStrategy::Full => ctx.request_resume(ResumeTarget {
                node_path: checkpoint.node_path.clone(),
                subgraph_inputs: checkpoint.subgraph_inputs.clone(),
                input: checkpoint.last_input.clone(),
            }),
            RollbackStrategy::HistoryOnly => ctx.clear_resume(),
        }
        tracing::info!(
            run_id = %ctx.run_id(),
            checkpoint_id = %checkpoint.checkpoint_id,
            node_path = ?checkpoint.node_path,
            strategy = ?self.strategy,
            "checkpoint restored"
        );
        Ok(())
    }

    async fn save(&self, run_id: &str, snapshot: Snapshot) -> Result<Checkpoint, GraphError> {
        let Snapshot {
            target,
            input_type,
            state,
        } = snapshot;
        let latest = self.latest_checkpoint(run_id).await?;
        let mut created_at = Utc::now();
        let mut version = 1;
        if let Some(latest) = &latest {
            let floor = latest.created_at + Duration::microseconds(1);
            if created_at < floor {
                created_at = floor;
            }
            version = latest.version + 1;
        }
        let checkpoint = Checkpoint {
            checkpoint_id: Uuid::new_v4().to_string(),
            created_at,
            node_path: target.node_path,
            subgraph_inputs: target.subgraph_inputs,
            last_input: target.input,
            last_input_type: input_type,
            history: state.history,
            executed_tool_calls: state.executed,
            version,
        };
        self.storage.save_checkpoint(run_id, &checkpoint).await?;
        tracing::debug!(
            run_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            node_path = ?checkpoint.node_path,
            version,
            "checkpoint saved"
        );
        Ok(checkpoint)
    }
}

/// Calls to undo when restoring `checkpoint`, oldest first.
///
/// Calls this context executed are decided by its ledger: every one the
/// checkpoint does not list as already executed is undone. The history
/// contributes the other results that entered it after the checkpoint, such
/// as calls made before this context existed. When the history has diverged
/// from the checkpoint only the ledger can answer, and without one the
/// restore fails.
fn calls_to_revert(
    ctx: &AgentContext,
    checkpoint: &Checkpoint,
) -> Result<Vec<ToolCall>, GraphError> {
    let before: HashSet<&str> = checkpoint
        .executed_tool_calls
        .iter()
        .map(String::as_str)
        .chain(result_ids(&checkpoint.history))
        .collect();
    let ledger: Option<&[ToolCall]> = ctx.storage().get_typed(&EXECUTED_CALLS).map(Vec::as_slice);
    let in_ledger = |id: &str| ledger.unwrap_or_default().iter().any(|call| call.id == id);

    let from_history = match calls_after(ctx.history().messages(), &checkpoint.history)? {
        Some(calls) => calls,
        None if ledger.is_some() => Vec::new(),
        None => {
            return Err(GraphError::Restore(format!(
                "history no longer extends checkpoint '{}'; \
                 the tool calls made since cannot be determined",
                checkpoint.checkpoint_id
            )))
        }
    };

    let mut calls: Vec<ToolCall> = from_history
        .into_iter()
        .filter(|call| !in_ledger(&call.id))
        .collect();
    calls.extend(
        ledger
            .unwrap_or_default()
            .iter()
            .filter(|call| !before.contains(call.id.as_str()))
            .cloned(),
    );
    Ok(calls)
}
