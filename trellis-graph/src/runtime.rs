use futures::future::BoxFuture;
use trellis_core::{NodeValue, Value};

use crate::edge::Selection;
use crate::graph::{GraphProgram, NodeKind, NodeSlot, FINISH_INDEX, START_INDEX};
use crate::node::{unpack, Payload};
use crate::pipeline::{
    NodeCompleted, NodeFailed, NodeStarting, RunCompleted, RunFailed, RunStarting,
};
use crate::{AgentContext, Graph, GraphError};

enum Flow {
    Done(Payload),
    /// A full restore was requested; unwind to the root and descend again.
    Jump,
}

enum Outcome {
    Output(Payload),
    Jump,
}

/// Runs `graph` to completion on `ctx`.
///
/// Fires `RunStarting`, then one `NodeStarting`/`NodeCompleted` pair per node
/// (or `NodeFailed`), then `RunCompleted` or `RunFailed`. A resume target left
/// on the context by a previous restore is honoured before `input` is used.
///
/// Values pass between nodes as they are; they are serialized only for event
/// payloads and the recorded position.
pub async fn run_graph<I: NodeValue, O: NodeValue>(
    graph: &Graph<I, O>,
    ctx: &mut AgentContext,
    input: I,
) -> Result<O, GraphError> {
    let input_json = serde_json::to_value(&input)?;
    ctx.begin_run();
    tracing::info!(run_id = %ctx.run_id(), graph = %graph.name(), "run starting");

    let result = match ctx
        .fire(RunStarting {
            run_id: ctx.run_id().to_string(),
            input: input_json,
        })
        .await
    {
        Ok(()) => drive(&graph.program, ctx, Box::new(input)).await,
        Err(err) => Err(err),
    };

    let output = match result.and_then(unpack::<O>) {
        Ok(output) => output,
        Err(err) => {
            if matches!(err, GraphError::Cancelled) {
                ctx.position_mut().rewind();
            }
            tracing::warn!(run_id = %ctx.run_id(), error = %err, "run failed");
            let failed = RunFailed {
                run_id: ctx.run_id().to_string(),
                error_kind: err.kind(),
                message: err.to_string(),
            };
            return Err(match ctx.fire(failed).await {
                Ok(()) => err,
                Err(reporting) => reporting.while_reporting(err),
            });
        }
    };

    ctx.fire(RunCompleted {
        run_id: ctx.run_id().to_string(),
        output: serde_json::to_value(&output)?,
    })
    .await?;
    tracing::info!(run_id = %ctx.run_id(), steps = ctx.steps(), "run completed");
    Ok(output)
}

async fn drive(
    program: &GraphProgram,
    ctx: &mut AgentContext,
    input: Payload,
) -> Result<Payload, GraphError> {
    let mut input = Some(input);
    loop {
        match traverse(program, ctx, input.take()).await? {
            Flow::Done(output) => return Ok(output),
            Flow::Jump => {
                tracing::debug!(resume = ?ctx.pending_resume(), "resuming at restored position");
            }
        }
    }
}

/// `input` is consumed at START; it is `None` when descending to a resume
/// target, which carries its own recorded inputs.
fn traverse<'a>(
    program: &'a GraphProgram,
    ctx: &'a mut AgentContext,
    input: Option<Payload>,
) -> BoxFuture<'a, Result<Flow, GraphError>> {
    Box::pin(async move {
        let (mut current, mut input) = match (ctx.take_resume_step(), input) {
            (Some((name, recorded)), _) => resume_at(program, &name, recorded)?,
            (None, Some(input)) => (START_INDEX, input),
            (None, None) => {
                return Err(GraphError::Restore(format!(
                    "no input to enter graph '{}' with",
                    program.name
                )))
            }
        };

        loop {
            if ctx.cancellation_token().is_cancelled() {
                return Err(GraphError::Cancelled);
            }
            let slot = &program.nodes[current];
            if matches!(slot.kind, NodeKind::Task(_) | NodeKind::Subgraph(_)) {
                ctx.count_step()?;
            }

            let input_json = input.to_json()?;
            ctx.position_mut()
                .begin_node(&slot.name, input_json.clone(), slot.types.input);
            let node_path = ctx.position().node_path();
            tracing::debug!(node = %slot.name, path = ?node_path, "node starting");
            ctx.fire(NodeStarting {
                node: slot.name.clone(),
                node_path: node_path.clone(),
                step_id: ctx.position().step_id(),
                parent_step_id: ctx.position().parent_step_id(),
                input: input_json.clone(),
                input_type: slot.types.input.to_string(),
            })
            .await?;

            let output = match run_slot(slot, ctx, input).await {
                Ok(Outcome::Output(output)) => output,
                Ok(Outcome::Jump) => return Ok(Flow::Jump),
                Err(err) => {
                    let path = node_path.join("/");
                    if matches!(err, GraphError::Cancelled) {
                        return Err(err);
                    }
                    tracing::debug!(node = %path, error = %err, "node failed");
                    let failed = NodeFailed {
                        node: slot.name.clone(),
                        node_path: node_path.clone(),
                        step_id: ctx.position().step_id(),
                        parent_step_id: ctx.position().parent_step_id(),
                        error_kind: err.kind(),
                        message: err.to_string(),
                    };
                    let err = err.at_node(&path);
                    return Err(match ctx.fire(failed).await {
                        Ok(()) => err,
                        Err(reporting) => reporting.while_reporting(err),
                    });
                }
            };

            ctx.fire(NodeCompleted {
                node: slot.name.clone(),
                node_path: node_path.clone(),
                step_id: ctx.position().step_id(),
                parent_step_id: ctx.position().parent_step_id(),
                input: input_json,
                input_type: slot.types.input.to_string(),
                output: output.to_json()?,
                output_type: slot.types.output.to_string(),
            })
            .await?;
            ctx.position_mut().complete_node();

            if ctx.pending_resume().is_some() {
                return Ok(Flow::Jump);
            }
            if current == FINISH_INDEX {
                return Ok(Flow::Done(output));
            }

            let path = node_path.join("/");
            let (next, next_input) =
                select_edge(program, current, output, &path).map_err(|err| err.at_node(&path))?;
            current = next;
            input = next_input;
        }
    })
}

/// Locates `name` and rebuilds its recorded input. Subgraph nodes on the way
/// to the leaf are re-entered with the input they originally received.
fn resume_at(
    program: &GraphProgram,
    name: &str,
    recorded: Option<Value>,
) -> Result<(usize, Payload), GraphError> {
    let index = program.index_of(name).ok_or_else(|| {
        GraphError::Restore(format!(
            "node '{name}' does not exist in graph '{}'",
            program.name
        ))
    })?;
    let slot = &program.nodes[index];
    let Some(input) = recorded else {
        return Err(GraphError::Restore(format!(
            "no input recorded for node '{name}' in graph '{}'",
            program.name
        )));
    };
    let input = (slot.types.decode)(input).map_err(|_| {
        GraphError::Restore(format!(
            "recorded input cannot be decoded as {} for node '{name}'",
            slot.types.input
        ))
    })?;
    Ok((index, input))
}

async fn run_slot(
    slot: &NodeSlot,
    ctx: &mut AgentContext,
    input: Payload,
) -> Result<Outcome, GraphError> {
    match &slot.kind {
        NodeKind::Start | NodeKind::Finish => Ok(Outcome::Output(input)),
        NodeKind::Task(node) => {
            let token = ctx.cancellation_token().clone();
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(GraphError::Cancelled),
                result = node.invoke(ctx, input) => result.map(Outcome::Output),
            }
        }
        NodeKind::Subgraph(sub) => {
            let tools = match &sub.options.tools {
                Some(names) => ctx.tools().subset(names)?,
                None => ctx.tools().clone(),
            };
            let model = sub
                .options
                .model
                .clone()
                .unwrap_or_else(|| ctx.model().to_string());

            let (outer_tools, outer_model) = ctx.swap_scope(tools, model);
            ctx.position_mut().enter_subgraph();
            let result = traverse(&sub.program, ctx, Some(input)).await;
            ctx.position_mut().exit_subgraph();
            ctx.swap_scope(outer_tools, outer_model);

            match result? {
                Flow::Done(output) => Ok(Outcome::Output(output)),
                Flow::Jump => Ok(Outcome::Jump),
            }
        }
    }
}

/// First matching edge in declaration order wins.
fn select_edge(
    program: &GraphProgram,
    from: usize,
    output: Payload,
    path: &str,
) -> Result<(usize, Payload), GraphError> {
    let mut output = output;
    for edge in &program.outgoing[from] {
        match (edge.select)(output)? {
            Selection::Taken(input) => return Ok((edge.to, input)),
            Selection::Skipped(unused) => output = unused,
        }
    }
    Err(GraphError::DeadEnd {
        node: path.to_string(),
    })
}
