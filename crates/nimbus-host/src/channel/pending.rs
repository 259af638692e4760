//! In-flight invocations awaiting a worker response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use nimbus_proto::rpc::{status_result, InvocationResponse, ParameterBinding, TypedData};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::InvocationError;

/// Output of a successful invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult {
    pub invocation_id: String,
    pub outputs: Vec<ParameterBinding>,
    pub return_value: Option<TypedData>,
}

impl InvocationResult {
    /// Builds the caller-facing result from a worker response.
    pub(crate) fn from_response(response: InvocationResponse) -> Result<Self, InvocationError> {
        let status = response.result.unwrap_or_default();
        match status.status() {
            status_result::Status::Success => Ok(Self {
                invocation_id: response.invocation_id,
                outputs: response.output_data,
                return_value: response.return_value,
            }),
            status_result::Status::Cancelled => Err(InvocationError::Cancelled),
            status_result::Status::Failure => Err(InvocationError::Failed(status.error_message())),
        }
    }
}

pub(crate) type Completion = Result<InvocationResult, InvocationError>;

#[derive(Debug)]
struct PendingInvocation {
    function_id: String,
    started: Instant,
    completion: oneshot::Sender<Completion>,
}

/// Table of pending invocations keyed by invocation id.
///
/// Each entry is fulfilled at most once: whoever removes it from the map owns
/// the completion handle.
#[derive(Debug, Clone, Default)]
pub(crate) struct PendingTable {
    entries: Arc<Mutex<HashMap<String, PendingInvocation>>>,
}

impl PendingTable {
    /// Registers an invocation. Returns `None` if the id is already pending.
    pub fn insert(
        &self,
        invocation_id: &str,
        function_id: &str,
    ) -> Option<(oneshot::Receiver<Completion>, PendingGuard)> {
        let mut entries = self.entries.lock();
        if entries.contains_key(invocation_id) {
            return None;
        }
        let (completion, receiver) = oneshot::channel();
        entries.insert(
            invocation_id.to_owned(),
            PendingInvocation {
                function_id: function_id.to_owned(),
                started: Instant::now(),
                completion,
            },
        );
        let guard = PendingGuard {
            table: self.clone(),
            invocation_id: invocation_id.to_owned(),
        };
        Some((receiver, guard))
    }

    /// Fulfils an invocation. Returns the function id and elapsed time, or
    /// `None` if nothing was pending under that id.
    pub fn complete(&self, invocation_id: &str, completion: Completion) -> Option<(String, std::time::Duration)> {
        let entry = self.entries.lock().remove(invocation_id)?;
        let elapsed = entry.started.elapsed();
        // The caller may have stopped waiting; the entry is gone either way.
        let _ = entry.completion.send(completion);
        Some((entry.function_id, elapsed))
    }

    /// Drops an invocation without fulfilling it.
    pub fn remove(&self, invocation_id: &str) -> bool {
        self.entries.lock().remove(invocation_id).is_some()
    }

    /// Returns true if the invocation is still pending.
    pub fn contains(&self, invocation_id: &str) -> bool {
        self.entries.lock().contains_key(invocation_id)
    }

    /// Fulfils every pending invocation with `error`. Returns the count.
    pub fn fail_all(&self, error: &InvocationError) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.completion.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Removes the pending entry if the waiting caller goes away.
#[derive(Debug)]
pub(crate) struct PendingGuard {
    table: PendingTable,
    invocation_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.remove(&self.invocation_id);
    }
}
