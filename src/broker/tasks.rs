//! Background task pool
//!
//! Provision, update, deprovision and recreate finish their work in the
//! background. At most one task runs per instance, and at most
//! `max_concurrent` tasks run at all. Every task gets a cancellation token;
//! a replacing task cancels its predecessor and starts only once the
//! predecessor has finished.

use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::cluster::ClusterId;
use crate::context::{OpContext, Operation};

struct ActiveTask {
    task_id: Uuid,
    operation: Operation,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// The task of another operation already runs for the instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Busy {
    pub instance_id: ClusterId,
    pub operation: Operation,
}

#[derive(Clone)]
pub struct TaskPool {
    permits: Arc<Semaphore>,
    active: Arc<DashMap<ClusterId, ActiveTask>>,
}

impl TaskPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn is_active(&self, id: &ClusterId) -> bool {
        self.active.contains_key(id)
    }

    /// Operation of the task running for the instance
    pub fn active_operation(&self, id: &ClusterId) -> Option<Operation> {
        self.active.get(id).map(|t| t.operation)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Start `work` for `ctx.instance_id` unless a task already runs for it
    pub fn spawn<F, Fut>(&self, ctx: OpContext, work: F) -> Result<(), Busy>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (task, done_tx) = new_task(ctx.operation);
        let cancel = task.cancel.clone();
        let task_id = task.task_id;

        match self.active.entry(ctx.instance_id.clone()) {
            Entry::Occupied(existing) => {
                return Err(Busy {
                    instance_id: ctx.instance_id.clone(),
                    operation: existing.get().operation,
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(task);
            }
        }

        self.launch(ctx, task_id, cancel, None, done_tx, work);
        Ok(())
    }

    /// Start `work`, cancelling whatever runs for the instance.
    ///
    /// `work` starts once the cancelled task has finished.
    pub fn spawn_replacing<F, Fut>(&self, ctx: OpContext, work: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (task, done_tx) = new_task(ctx.operation);
        let cancel = task.cancel.clone();
        let task_id = task.task_id;

        let previous = self.active.insert(ctx.instance_id.clone(), task);
        let predecessor = previous.map(|p| {
            debug!(
                "Cancelling {} task of {} in favour of {}",
                p.operation, ctx.instance_id, ctx.operation
            );
            p.cancel.cancel();
            p.done
        });

        self.launch(ctx, task_id, cancel, predecessor, done_tx, work);
    }

    /// Cancel the instance's task, returning whether one was running
    pub fn cancel(&self, id: &ClusterId) -> bool {
        match self.active.get(id) {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until no task runs for the instance
    pub async fn wait_idle(&self, id: &ClusterId) {
        loop {
            let done = match self.active.get(id) {
                Some(task) => task.done.clone(),
                None => return,
            };
            wait_done(done).await;
        }
    }

    fn launch<F, Fut>(
        &self,
        ctx: OpContext,
        task_id: Uuid,
        cancel: CancellationToken,
        predecessor: Option<watch::Receiver<bool>>,
        done_tx: watch::Sender<bool>,
        work: F,
    ) where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let active = self.active.clone();
        let span = ctx.span();

        tokio::spawn(
            async move {
                // released even if `work` panics
                let _finished = Finished {
                    active,
                    instance_id: ctx.instance_id.clone(),
                    task_id,
                    done_tx,
                };

                if let Some(previous) = predecessor {
                    wait_done(previous).await;
                }

                match permits.acquire_owned().await {
                    Ok(_permit) => {
                        debug!("Starting {} task", ctx.operation);
                        work(cancel).await;
                        debug!("Finished {} task", ctx.operation);
                    }
                    Err(e) => warn!("Task pool closed, dropping {} task: {}", ctx.operation, e),
                }
            }
            .instrument(span),
        );
    }
}

/// Unregisters a task and signals its completion when dropped
struct Finished {
    active: Arc<DashMap<ClusterId, ActiveTask>>,
    instance_id: ClusterId,
    task_id: Uuid,
    done_tx: watch::Sender<bool>,
}

impl Drop for Finished {
    fn drop(&mut self) {
        let task_id = self.task_id;
        self.active
            .remove_if(&self.instance_id, |_, t| t.task_id == task_id);
        let _ = self.done_tx.send(true);
    }
}

fn new_task(operation: Operation) -> (ActiveTask, watch::Sender<bool>) {
    let (done_tx, done_rx) = watch::channel(false);
    let task = ActiveTask {
        task_id: Uuid::new_v4(),
        operation,
        cancel: CancellationToken::new(),
        done: done_rx,
    };
    (task, done_tx)
}

/// Resolves once the task behind `done` finished or went away
async fn wait_done(mut done: watch::Receiver<bool>) {
    let _ = done.wait_for(|finished| *finished).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn ctx(op: Operation, id: &str) -> OpContext {
        OpContext::new(op, ClusterId::from(id))
    }

    #[tokio::test]
    async fn test_one_task_per_instance() {
        let pool = TaskPool::new(4);
        let id = ClusterId::from("a");
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        pool.spawn(ctx(Operation::Provision, "a"), move |_| async move {
            let _ = release_rx.await;
        })
        .unwrap();

        let busy = pool
            .spawn(ctx(Operation::Update, "a"), |_| async {})
            .unwrap_err();
        assert_eq!(busy.operation, Operation::Provision);
        assert_eq!(pool.active_operation(&id), Some(Operation::Provision));

        // other instances are unaffected
        pool.spawn(ctx(Operation::Provision, "b"), |_| async {}).unwrap();

        release_tx.send(()).unwrap();
        pool.wait_idle(&id).await;
        assert!(!pool.is_active(&id));
    }

    #[tokio::test]
    async fn test_replacing_cancels_and_waits_for_predecessor() {
        let pool = TaskPool::new(4);
        let id = ClusterId::from("a");
        let order = Arc::new(AtomicUsize::new(0));

        let first_order = order.clone();
        pool.spawn(ctx(Operation::Provision, "a"), move |cancel| async move {
            cancel.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            first_order.store(1, Ordering::SeqCst);
        })
        .unwrap();

        let second_order = order.clone();
        pool.spawn_replacing(ctx(Operation::Deprovision, "a"), move |_| async move {
            // predecessor finished before this runs
            assert_eq!(second_order.load(Ordering::SeqCst), 1);
            second_order.store(2, Ordering::SeqCst);
        });
        assert_eq!(pool.active_operation(&id), Some(Operation::Deprovision));

        pool.wait_idle(&id).await;
        assert_eq!(order.load(Ordering::SeqCst), 2);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel() {
        let pool = TaskPool::new(1);
        let id = ClusterId::from("a");
        assert!(!pool.cancel(&id));

        pool.spawn(ctx(Operation::Update, "a"), |cancel| async move {
            cancel.cancelled().await;
        })
        .unwrap();
        assert!(pool.cancel(&id));
        tokio_test::assert_ok!(
            tokio::time::timeout(Duration::from_secs(5), pool.wait_idle(&id)).await
        );
    }
}
