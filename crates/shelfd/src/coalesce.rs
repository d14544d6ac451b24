//! Merge request coalescing.
//!
//! At most one merge pass runs at a time and at most one request waits.
//! Requests arriving while a pass runs collapse into the single pending
//! slot; `force` survives the collapse.

use std::future::Future;

use tokio::sync::Mutex;

/// One merge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub reason: String,
    pub force: bool,
}

/// Outcome of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDispatchOutcome {
    Success,
    Failure,
    NoPendingRequest,
}

#[derive(Debug, Default)]
struct CoalescerState {
    pending: Option<MergeRequest>,
    running: bool,
}

/// The coalescer.
#[derive(Debug, Default)]
pub struct MergeCoalescer {
    state: Mutex<CoalescerState>,
}

impl MergeCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request, collapsing into any existing pending one.
    pub async fn request(&self, reason: &str, force: bool) {
        let mut state = self.state.lock().await;
        state.pending = Some(match state.pending.take() {
            None => MergeRequest {
                reason: reason.to_string(),
                force,
            },
            Some(existing) => {
                // Force wins the collision; a forced reason is not
                // diluted by a later unforced request.
                let keep_existing_reason = existing.force && !force;
                MergeRequest {
                    reason: if keep_existing_reason {
                        existing.reason
                    } else {
                        reason.to_string()
                    },
                    force: existing.force || force,
                }
            }
        });
    }

    pub async fn has_pending(&self) -> bool {
        self.state.lock().await.pending.is_some()
    }

    /// Run the pending request, if any, through `run`.
    ///
    /// Concurrent dispatches see the running flag and return
    /// `NoPendingRequest`; their request stays queued for the next turn.
    pub async fn dispatch<F, Fut>(&self, run: F) -> MergeDispatchOutcome
    where
        F: FnOnce(MergeRequest) -> Fut,
        Fut: Future<Output = MergeDispatchOutcome>,
    {
        let request = {
            let mut state = self.state.lock().await;
            if state.running {
                return MergeDispatchOutcome::NoPendingRequest;
            }
            let Some(request) = state.pending.take() else {
                return MergeDispatchOutcome::NoPendingRequest;
            };
            state.running = true;
            request
        };

        let outcome = run(request).await;

        let mut state = self.state.lock().await;
        state.running = false;
        outcome
    }
}
