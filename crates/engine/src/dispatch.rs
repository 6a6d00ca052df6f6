//! Concurrent dispatch of one tool invocation batch.

use futures::future::join_all;
use tracing::warn;

use crate::chunk::ChunkEmitter;
use crate::model::{InvocationStatus, ToolInvocationRequest};
use crate::registry::CapabilityRegistry;

/// A request together with the rendered output of its invocation.
#[derive(Debug, Clone)]
pub struct ResolvedInvocation {
    pub request: ToolInvocationRequest,
    pub content: String,
}

/// Outcome of one dispatched batch.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Results in detection order, regardless of which invocation finished
    /// first.
    pub results: Vec<ResolvedInvocation>,
    /// The batch named the completion sentinel tool.
    pub completion_requested: bool,
}

/// True when `identity` names the completion sentinel: an exact match, or a
/// namespaced form that ends in `_<sentinel>` or `.<sentinel>`.
pub fn matches_completion_tool(identity: &str, completion_tool: &str) -> bool {
    if completion_tool.is_empty() {
        return false;
    }
    identity == completion_tool
        || identity.ends_with(&format!("_{completion_tool}"))
        || identity.ends_with(&format!(".{completion_tool}"))
}

/// Invoke every resolvable request in the batch concurrently.
///
/// Unknown identities are dropped with a warning and never reach the
/// in-progress chunk. Each completion chunk is emitted the moment its
/// invocation resolves, so a UI sees per-tool progress even though results
/// are collected in detection order.
pub async fn dispatch_batch(
    registry: &CapabilityRegistry,
    requests: Vec<ToolInvocationRequest>,
    completion_tool: &str,
    emitter: &ChunkEmitter,
) -> DispatchOutcome {
    let mut resolved = Vec::new();
    let mut completion_requested = false;

    for mut request in requests {
        let Some(capability) = registry.resolve(&request.identity) else {
            warn!(tool = %request.identity, "model requested unknown tool, dropping");
            continue;
        };
        if matches_completion_tool(&request.identity, completion_tool) {
            completion_requested = true;
        }
        request.status = InvocationStatus::Invoking;
        resolved.push((request, capability));
    }

    if resolved.is_empty() {
        return DispatchOutcome {
            results: Vec::new(),
            completion_requested,
        };
    }

    let batch: Vec<ToolInvocationRequest> =
        resolved.iter().map(|(request, _)| request.clone()).collect();
    emitter.tool_in_progress(&batch);

    let invocations = resolved.into_iter().map(|(mut request, capability)| async move {
        let content = match capability.invoke(request.arguments.clone()).await {
            Ok(output) => {
                request.status = if output.is_error {
                    InvocationStatus::Error
                } else {
                    InvocationStatus::Done
                };
                output.rendered()
            }
            Err(err) => {
                warn!(tool = %request.identity, error = %err, "tool invocation failed");
                request.status = InvocationStatus::Error;
                err.to_string()
            }
        };
        emitter.tool_complete(&request);
        ResolvedInvocation { request, content }
    });

    // join_all keeps input order in its output.
    let results = join_all(invocations).await;

    DispatchOutcome {
        results,
        completion_requested,
    }
}
