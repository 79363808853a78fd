// src/orchestrator/executor.rs
// Bounded-concurrency DAG runner. Ready tasks start in a reproducible order
// (priority, then id), failures cut off their descendant subtree without
// touching independent branches, and cancellation is observed at every
// suspension point.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

use crate::errors::{DomeError, DomeResult, RetryPolicy};
use crate::orchestrator::plan::{Plan, TaskClass, TaskId, TaskNode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    /// A dependency failed; this task never ran.
    Unreachable,
    Cancelled,
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }
}

pub struct ExecLimits {
    pub vm: usize,
    pub postconfig: usize,
    pub retry: RetryPolicy,
}

/// Run the plan. `runner` executes one task; it is invoked concurrently up
/// to the class limits and must be cancel-safe at its await points.
pub async fn run_dag<F, Fut>(
    plan: &Plan,
    limits: &ExecLimits,
    cancel: watch::Receiver<bool>,
    runner: F,
) -> BTreeMap<TaskId, TaskOutcome>
where
    F: Fn(TaskNode) -> Fut,
    Fut: Future<Output = DomeResult<()>>,
{
    let vm_sem = Semaphore::new(limits.vm.max(1));
    let pc_sem = Semaphore::new(limits.postconfig.max(1));

    let mut outcomes: BTreeMap<TaskId, TaskOutcome> = BTreeMap::new();
    let mut pending: Vec<TaskNode> = plan.tasks.clone();
    let mut completed: HashSet<TaskId> = HashSet::new();
    let mut running = FuturesUnordered::new();

    loop {
        let cancelled = *cancel.borrow();
        if !cancelled {
            // Collect tasks whose dependencies are all satisfied, in the
            // reproducible tie-break order.
            let mut ready_idx: Vec<usize> = pending
                .iter()
                .enumerate()
                .filter(|(_, task)| task.depends_on.iter().all(|d| completed.contains(d)))
                .map(|(i, _)| i)
                .collect();
            ready_idx.sort_by(|a, b| {
                let (ta, tb) = (&pending[*a], &pending[*b]);
                ta.priority.cmp(&tb.priority).then_with(|| ta.id.cmp(&tb.id))
            });
            // Remove back-to-front so indices stay valid.
            let mut ready: Vec<TaskNode> = Vec::with_capacity(ready_idx.len());
            for idx in ready_idx.iter().rev() {
                ready.push(pending.remove(*idx));
            }
            ready.reverse();
            for task in ready {
                debug!(task = %task.id, "task ready");
                running.push(run_one(task, &vm_sem, &pc_sem, limits.retry, cancel.clone(), &runner));
            }
        }

        if running.is_empty() {
            break;
        }
        if let Some((id, outcome)) = running.next().await {
            if outcome.is_completed() {
                completed.insert(id.clone());
            } else {
                warn!(task = %id, ?outcome, "task did not complete");
            }
            outcomes.insert(id, outcome);
        }
    }

    // Whatever is still pending was starved by a failed or cancelled
    // ancestor. Independent branches have already run to completion.
    let leftover_outcome = if *cancel.borrow() { TaskOutcome::Cancelled } else { TaskOutcome::Unreachable };
    for task in pending {
        outcomes.insert(task.id, leftover_outcome.clone());
    }
    outcomes
}

async fn run_one<F, Fut>(
    task: TaskNode,
    vm_sem: &Semaphore,
    pc_sem: &Semaphore,
    retry: RetryPolicy,
    mut cancel: watch::Receiver<bool>,
    runner: &F,
) -> (TaskId, TaskOutcome)
where
    F: Fn(TaskNode) -> Fut,
    Fut: Future<Output = DomeResult<()>>,
{
    let _permit = match task.class {
        TaskClass::Vm => vm_sem.acquire().await.ok(),
        TaskClass::PostConfig => pc_sem.acquire().await.ok(),
        TaskClass::Network | TaskClass::Validate => None,
    };

    let attempts = task.max_attempts.max(1);
    let mut last_failure = String::new();
    for attempt in 1..=attempts {
        if *cancel.borrow() {
            return (task.id, TaskOutcome::Cancelled);
        }
        let result = tokio::select! {
            result = tokio::time::timeout(task.timeout, runner(task.clone())) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(DomeError::timeout(format!("task {}", task.id), task.timeout)),
                }
            }
            _ = cancel.changed() => return (task.id, TaskOutcome::Cancelled),
        };
        match result {
            Ok(()) => return (task.id, TaskOutcome::Completed),
            Err(err) if err.is_transient() && attempt < attempts => {
                let delay = retry.delay_before(attempt);
                warn!(task = %task.id, attempt, ?delay, %err, "transient task failure; backing off");
                last_failure = err.to_string();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.changed() => return (task.id, TaskOutcome::Cancelled),
                }
            }
            Err(err) => {
                return (task.id, TaskOutcome::Failed(format!("{}: {err}", err.kind())));
            }
        }
    }
    (task.id, TaskOutcome::Failed(format!("transient: {last_failure}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::plan::TaskKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn node(id: &str, deps: Vec<&str>, priority: i32) -> TaskNode {
        TaskNode {
            id: id.into(),
            kind: TaskKind::ValidateLab,
            depends_on: deps.into_iter().map(String::from).collect(),
            priority,
            class: TaskClass::Vm,
            timeout: Duration::from_secs(5),
            max_attempts: 2,
        }
    }

    fn limits() -> ExecLimits {
        ExecLimits {
            vm: 8,
            postconfig: 4,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                cap_delay: Duration::from_millis(2),
            },
        }
    }

    fn plan(tasks: Vec<TaskNode>) -> Plan {
        Plan { lab_name: "t".into(), tasks }
    }

    fn never_cancelled() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the test duration.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn runs_in_dependency_order() {
        let order = Mutex::new(Vec::new());
        let p = plan(vec![node("b", vec!["a"], 0), node("a", vec![], 0)]);
        let outcomes = run_dag(&p, &limits(), never_cancelled(), |task| {
            let order = &order;
            async move {
                order.lock().unwrap().push(task.id.clone());
                Ok(())
            }
        })
        .await;
        assert_eq!(*order.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(outcomes.values().all(TaskOutcome::is_completed));
    }

    #[tokio::test]
    async fn failure_cuts_off_descendants_only() {
        let p = plan(vec![
            node("root", vec![], 0),
            node("doomed", vec!["root"], 0),
            node("child-of-doomed", vec!["doomed"], 0),
            node("independent", vec!["root"], 0),
        ]);
        let outcomes = run_dag(&p, &limits(), never_cancelled(), |task| async move {
            if task.id == "doomed" {
                Err(DomeError::permanent("boom"))
            } else {
                Ok(())
            }
        })
        .await;
        assert!(outcomes["root"].is_completed());
        assert!(matches!(outcomes["doomed"], TaskOutcome::Failed(_)));
        assert_eq!(outcomes["child-of-doomed"], TaskOutcome::Unreachable);
        assert!(outcomes["independent"].is_completed());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calls = AtomicUsize::new(0);
        let p = plan(vec![node("flaky", vec![], 0)]);
        let outcomes = run_dag(&p, &limits(), never_cancelled(), |_task| {
            let calls = &calls;
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DomeError::transient("blip"))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(outcomes["flaky"].is_completed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let p = plan(vec![node("broken", vec![], 0)]);
        let outcomes = run_dag(&p, &limits(), never_cancelled(), |_task| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DomeError::permanent("no"))
            }
        })
        .await;
        assert!(matches!(outcomes["broken"], TaskOutcome::Failed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn task_timeout_is_transient_then_fails() {
        let calls = AtomicUsize::new(0);
        let mut slow = node("slow", vec![], 0);
        slow.timeout = Duration::from_millis(20);
        let p = plan(vec![slow]);
        let outcomes = run_dag(&p, &limits(), never_cancelled(), |_task| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
        })
        .await;
        // Two attempts, both timing out.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(outcomes["slow"], TaskOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_in_flight_and_pending_work() {
        let (tx, rx) = watch::channel(false);
        let p = plan(vec![node("long", vec![], 0), node("after", vec!["long"], 0)]);
        let task_limits = limits();
        let run = run_dag(&p, &task_limits, rx, |_task| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(true);
        };
        let (outcomes, ()) = tokio::join!(run, cancel);
        assert_eq!(outcomes["long"], TaskOutcome::Cancelled);
        assert_eq!(outcomes["after"], TaskOutcome::Cancelled);
    }

    #[tokio::test]
    async fn priority_breaks_ties_reproducibly() {
        let order = Mutex::new(Vec::new());
        let mut limits = limits();
        limits.vm = 1; // serialize so start order is observable
        let p = plan(vec![node("zeta", vec![], 0), node("alpha", vec![], 0), node("first", vec![], -1)]);
        run_dag(&p, &limits, never_cancelled(), |task| {
            let order = &order;
            async move {
                order.lock().unwrap().push(task.id.clone());
                Ok(())
            }
        })
        .await;
        assert_eq!(
            *order.lock().unwrap(),
            vec!["first".to_string(), "alpha".to_string(), "zeta".to_string()]
        );
    }
}
