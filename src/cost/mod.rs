//! Scoped monetary cost budgets for LLM calls.
//!
//! Nested scopes (batch run ⊃ intervention run ⊃ simulation run) all
//! observe every LLM call's cost: entering a [`CostScope`] pushes it onto a
//! per-task stack; [`record_cost`] walks the *entire* stack and adds to
//! every entry; leaving a scope checks its own budget one final time.

use std::sync::{Arc, Mutex};

use crate::error::{CostError, SitsimResult};

#[derive(Debug)]
struct CostManagerState {
    limit_usd: Option<f64>,
    spent_usd: f64,
}

tokio::task_local! {
    static ACTIVE_SCOPES: Mutex<Vec<Arc<Mutex<CostManagerState>>>>;
}

/// Namespace for the scoped cost-budget entry point; see [`CostScope::scoped`].
pub struct CostScope;

impl CostScope {
    /// Runs `body` inside a fresh cost scope nested under whatever scopes
    /// are already active on this task, pushing/popping the task-local
    /// stack around it. Returns `body`'s result alongside the total cost
    /// observed within this scope (not including sibling scopes), mirroring
    /// reading `cost_manager.current_usage` right before the `with` block
    /// that owns it exits.
    pub async fn scoped<F, Fut, T>(limit_usd: Option<f64>, body: F) -> SitsimResult<(T, f64)>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = SitsimResult<T>>,
    {
        let state = Arc::new(Mutex::new(CostManagerState {
            limit_usd,
            spent_usd: 0.0,
        }));

        let fut = async {
            push_scope(state.clone());
            let result = body().await;
            pop_scope();
            result
        };

        // Ensure a stack exists on this task even if this is the first scope.
        let result = if ACTIVE_SCOPES.try_with(|_| ()).is_err() {
            ACTIVE_SCOPES.scope(Mutex::new(Vec::new()), fut).await
        } else {
            fut.await
        };

        result.and_then(|value| {
            let spent = state.lock().expect("cost lock poisoned").spent_usd;
            if let Some(limit) = limit_usd
                && spent > limit
            {
                return Err(CostError::LimitExceeded { limit, spent }.into());
            }
            Ok((value, spent))
        })
    }
}

fn push_scope(state: Arc<Mutex<CostManagerState>>) {
    let _ = ACTIVE_SCOPES.try_with(|stack| stack.lock().expect("cost lock poisoned").push(state));
}

fn pop_scope() {
    let _ = ACTIVE_SCOPES.try_with(|stack| {
        stack.lock().expect("cost lock poisoned").pop();
    });
}

/// Checks whether *any* enclosing scope on this task is already at or over
/// its budget. Since the real cost of an upcoming call is unknown in
/// advance, this is the pre-call check described for the cost manager: it
/// refuses to start a call once any enclosing budget has already been
/// exhausted by a prior call.
pub fn ensure_budget_available() -> SitsimResult<()> {
    ACTIVE_SCOPES
        .try_with(|stack| {
            for scope in stack.lock().expect("cost lock poisoned").iter() {
                let s = scope.lock().expect("cost lock poisoned");
                if let Some(limit) = s.limit_usd
                    && s.spent_usd >= limit
                {
                    return Err(CostError::LimitExceeded {
                        limit,
                        spent: s.spent_usd,
                    });
                }
            }
            Ok(())
        })
        .unwrap_or(Ok(()))
        .map_err(Into::into)
}

/// Adds `cost_usd` to every active enclosing scope on this task, then
/// re-checks each one; the first scope found over budget raises, matching
/// "added to every active manager, then checked".
pub fn record_cost(cost_usd: f64) -> SitsimResult<()> {
    ACTIVE_SCOPES
        .try_with(|stack| {
            let mut over_budget = None;
            for scope in stack.lock().expect("cost lock poisoned").iter() {
                let mut s = scope.lock().expect("cost lock poisoned");
                s.spent_usd += cost_usd;
                if let Some(limit) = s.limit_usd
                    && s.spent_usd > limit
                    && over_budget.is_none()
                {
                    over_budget = Some(CostError::LimitExceeded {
                        limit,
                        spent: s.spent_usd,
                    });
                }
            }
            match over_budget {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
        .unwrap_or(Ok(()))
        .map_err(Into::into)
}
