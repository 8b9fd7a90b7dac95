//! Core actor runtime.
//!
//! An actor owns its state and processes one message at a time from an
//! unbounded mailbox. The building blocks are:
//! - `Actor` trait for defining actor behavior
//! - `ActorHandle` for enqueueing messages and asking questions
//! - `ActorContext` for self-addressed and delayed messages
//! - `ActorRef` for stopping an actor and waiting for it to finish

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// Behavior of a single-threaded actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Hand long-running work to spawned tasks that report back by message
#[async_trait]
pub trait Actor: Send + 'static {
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext<Self::Message>,
    ) -> Result<bool, ActorError>;

    async fn on_start(&mut self, _ctx: &mut ActorContext<Self::Message>) -> Result<(), ActorError> {
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<Self::Message>) {}
}

/// Context provided to actors during message handling.
pub struct ActorContext<M: Message> {
    /// Handle to the actor's own mailbox.
    handle: ActorHandle<M>,

    pub messages_processed: u64,

    pub state: ActorState,
}

impl<M: Message> ActorContext<M> {
    fn new(handle: ActorHandle<M>) -> Self {
        Self {
            handle,
            messages_processed: 0,
            state: ActorState::Starting,
        }
    }

    /// A handle the actor can give to spawned tasks so they can report back.
    pub fn handle(&self) -> &ActorHandle<M> {
        &self.handle
    }

    /// Enqueues a message to self behind everything already in the mailbox.
    pub fn notify(&self, msg: M) {
        // The loop only exits after its own handle is dropped, so this
        // cannot fail while a handler is running.
        let _ = self.handle.send(msg);
    }

    /// Delivers `msg` to self after `delay`. The returned timer can be
    /// cancelled before it fires.
    pub fn delay(&self, delay: Duration, msg: M) -> TimerHandle {
        let handle = self.handle.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = handle.send(msg);
        });
        TimerHandle { task }
    }
}

/// Actor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// A pending delayed message.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl TimerHandle {
    #[cfg(test)]
    pub(crate) fn from_task(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    /// Cancels the timer. A no-op if it already fired.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ActorError {
    /// Error that stops the actor.
    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("actor stopped")]
    ActorStopped,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::UnboundedSender<M>,

    /// Messages enqueued but not yet picked up by the loop.
    pending: Arc<AtomicUsize>,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Enqueues a message without waiting for it to be processed.
    pub fn send(&self, msg: M) -> Result<(), ActorError> {
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.tx.send(msg).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            ActorError::ActorStopped
        })
    }

    /// Sends a message carrying a reply channel and waits for the answer.
    pub async fn ask<R, F>(&self, make: F) -> Result<R, ActorError>
    where
        F: FnOnce(oneshot::Sender<R>) -> M,
    {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| ActorError::ActorStopped)
    }

    /// Number of messages waiting in the mailbox.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owner's reference to a running actor.
pub struct ActorRef {
    pub actor_id: String,

    task_handle: JoinHandle<()>,

    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    /// Signal the actor to stop after the message it is handling.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stops the actor and waits for its loop to exit.
    pub async fn terminate(self) {
        self.stop();
        if let Err(e) = self.task_handle.await {
            if e.is_panic() {
                error!(actor_id = %self.actor_id, "Actor panicked");
            }
        }
    }
}

// =============================================================================
// Spawning
// =============================================================================

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Spawns `actor` on the current runtime.
pub fn spawn<A: Actor>(actor: A) -> (ActorHandle<A::Message>, ActorRef) {
    let actor_id = format!(
        "{}_{}",
        actor.name(),
        ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
    );
    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = ActorHandle {
        tx,
        pending: Arc::new(AtomicUsize::new(0)),
    };

    let task_handle = tokio::spawn(run_actor_loop(
        actor,
        rx,
        handle.clone(),
        shutdown_rx,
        actor_id.clone(),
    ));

    info!(actor_id = %actor_id, "Spawned actor");

    (
        handle,
        ActorRef {
            actor_id,
            task_handle,
            shutdown_tx,
        },
    )
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::UnboundedReceiver<A::Message>,
    handle: ActorHandle<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let pending = Arc::clone(&handle.pending);
    let mut ctx = ActorContext::new(handle);

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        rx.close();
        return;
    }

    ctx.state = ActorState::Running;
    debug!(actor_id = %actor_id, "Actor started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };
                pending.fetch_sub(1, Ordering::Relaxed);
                ctx.messages_processed += 1;

                match actor.handle(msg, &mut ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(actor_id = %actor_id, "Actor requested stop");
                        break;
                    }
                    Err(ActorError::Permanent(reason)) => {
                        error!(actor_id = %actor_id, error = %reason, "Actor failed");
                        ctx.state = ActorState::Failed;
                        break;
                    }
                    Err(e) => {
                        error!(actor_id = %actor_id, error = %e, "Actor error");
                    }
                }
            }
        }
    }

    // Refuse new messages; anything already queued is dropped along with
    // its reply channels.
    rx.close();

    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopping;
    }
    actor.on_stop(&mut ctx).await;
    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopped;
    }

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum CounterMsg {
        Add(u64),
        Get(oneshot::Sender<u64>),
        AddLater(Duration, u64),
        Fail,
    }

    struct Counter {
        total: u64,
    }

    #[async_trait]
    impl Actor for Counter {
        type Message = CounterMsg;

        fn name(&self) -> &str {
            "counter"
        }

        async fn handle(
            &mut self,
            msg: CounterMsg,
            ctx: &mut ActorContext<CounterMsg>,
        ) -> Result<bool, ActorError> {
            match msg {
                CounterMsg::Add(n) => self.total += n,
                CounterMsg::Get(reply) => {
                    let _ = reply.send(self.total);
                }
                CounterMsg::AddLater(after, n) => {
                    ctx.delay(after, CounterMsg::Add(n));
                }
                CounterMsg::Fail => return Err(ActorError::Permanent("boom".into())),
            }
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_messages_processed_in_order() {
        let (handle, actor) = spawn(Counter { total: 0 });
        for i in 1..=10 {
            handle.send(CounterMsg::Add(i)).unwrap();
        }
        let total = handle.ask(CounterMsg::Get).await.unwrap();
        assert_eq!(total, 55);
        assert_eq!(handle.pending(), 0);
        actor.terminate().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_message() {
        let (handle, actor) = spawn(Counter { total: 0 });
        handle
            .send(CounterMsg::AddLater(Duration::from_secs(5), 7))
            .unwrap();
        assert_eq!(handle.ask(CounterMsg::Get).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(handle.ask(CounterMsg::Get).await.unwrap(), 7);
        actor.terminate().await;
    }

    #[tokio::test]
    async fn test_permanent_error_stops_actor() {
        let (handle, actor) = spawn(Counter { total: 0 });
        handle.send(CounterMsg::Fail).unwrap();
        actor.terminate().await;
        assert!(matches!(
            handle.ask(CounterMsg::Get).await,
            Err(ActorError::ActorStopped)
        ));
    }

    #[tokio::test]
    async fn test_terminate_is_observed_by_handles() {
        let (handle, actor) = spawn(Counter { total: 0 });
        actor.terminate().await;
        assert!(handle.is_closed());
        assert!(handle.send(CounterMsg::Add(1)).is_err());
    }
}
