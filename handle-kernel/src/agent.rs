//! Single-consumer work queue that drains release requests and drives the
//! registry's destroy path off the caller's thread.

use std::sync::{Mutex, Weak};

use handle_primitives::{HandleError, HandleKey};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::registry::Registry;

/// Tunables for the unregistration agent.
#[derive(Debug, Clone, Copy)]
pub struct AgentConfig {
    report_unknown_unregister: bool,
}

impl AgentConfig {
    /// Creates a configuration with the given policy for `Unregister` of an
    /// unknown key.
    #[must_use]
    pub const fn new(report_unknown_unregister: bool) -> Self {
        Self {
            report_unknown_unregister,
        }
    }

    /// Returns whether draining an `Unregister` of a key the registry has
    /// never heard of is reported to the error sink. Defaults to `true`:
    /// missing keys surface as errors when the agent drains the request.
    #[must_use]
    pub const fn report_unknown_unregister(self) -> bool {
        self.report_unknown_unregister
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Errors raised by the agent's own enqueue path, distinct from
/// [`HandleError`] (the registration-protocol error set). Kept as its own
/// enum so that a `Stopped` agent is never confused with a registration
/// race.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    /// The agent has been stopped (or is stopping) and will not accept
    /// further release requests.
    #[error("unregistration agent has stopped accepting work")]
    Stopped,
}

/// Result alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

enum Command {
    Release(HandleKey),
    Shutdown,
}

/// The unregistration agent: a single `tokio` task draining a FIFO queue
/// of release requests. `Stop` is implemented by enqueuing a `Shutdown`
/// sentinel onto the same queue. The sentinel only forecloses *new* work;
/// it does not by itself guarantee everything already queued has run —
/// a cascade from a teardown that was already in flight when `Shutdown`
/// was sent enqueues its dependency releases *behind* the sentinel, so
/// the consumer does a second, non-blocking drain pass after the sentinel
/// to pick those up before it actually exits.
pub(crate) struct Agent {
    sender: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: OnceCell<()>,
    config: AgentConfig,
}

impl Agent {
    /// Spawns the consumer task. `registry` is weak so the agent never
    /// keeps the registry it serves alive on its own; when the registry is
    /// dropped, the next pop is skipped and the loop exits.
    pub(crate) fn spawn(registry: Weak<Registry>, config: AgentConfig) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Command>();

        let worker = tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                match command {
                    Command::Shutdown => break,
                    Command::Release(key) => {
                        if !Self::process_release(&registry, &config, &key) {
                            break;
                        }
                    }
                }
            }

            // `Shutdown` has been consumed, but a release processed above
            // may have cascaded into dependency releases enqueued after the
            // sentinel. Keep draining with `try_recv` (never waiting for
            // new work) until the queue is genuinely empty: each release
            // drained here can itself enqueue more, landing at the tail of
            // this same queue, so the loop keeps picking those up too.
            while let Ok(command) = receiver.try_recv() {
                if let Command::Release(key) = command {
                    if !Self::process_release(&registry, &config, &key) {
                        break;
                    }
                }
            }

            debug!("unregistration agent drained and stopped");
        });

        Self {
            sender,
            worker: Mutex::new(Some(worker)),
            shutdown: OnceCell::new(),
            config,
        }
    }

    /// Runs one release request against the registry. Returns `false` if
    /// the registry has already been dropped, signalling the caller to
    /// stop draining — there is nothing left to destroy against.
    fn process_release(registry: &Weak<Registry>, config: &AgentConfig, key: &HandleKey) -> bool {
        let Some(registry) = registry.upgrade() else {
            debug!("registry dropped; unregistration agent exiting early");
            return false;
        };

        if let Err(err) = registry.remove_and_destroy_handle(key) {
            let suppress = matches!(err, HandleError::ObjectNotFound(_))
                && !config.report_unknown_unregister;
            if !suppress {
                registry.report_error(key, &err);
            }
        }
        true
    }

    /// Enqueues a release request. Never blocks beyond a channel send;
    /// returns immediately. Succeeds even while a concurrent `stop` is
    /// draining — rejecting only once the consumer task has actually
    /// exited and dropped its receiver — so that a release racing
    /// shutdown still gets picked up by the trailing drain pass instead of
    /// being silently refused.
    pub(crate) fn enqueue(&self, key: HandleKey) -> AgentResult<()> {
        self.sender
            .send(Command::Release(key))
            .map_err(|_| AgentError::Stopped)
    }

    /// Idempotent graceful stop: signals the consumer to exit after
    /// draining everything already queued, then waits for it to exit.
    /// Concurrent callers all await the same shutdown, so every call that
    /// returns has the same "no further destructors will run" guarantee.
    pub(crate) async fn stop(&self) {
        self.shutdown
            .get_or_init(|| async {
                let _ = self.sender.send(Command::Shutdown);
                let handle = self.worker.lock().expect("agent poisoned").take();
                if let Some(handle) = handle {
                    let _ = handle.await;
                }
            })
            .await;
    }
}

impl Drop for Agent {
    /// Best-effort shutdown when a `Registry` is dropped without an
    /// explicit `stop_agent().await`. Sends the same `Shutdown` sentinel
    /// `stop` would, so a consumer that is still running drains its
    /// already-queued work and exits; the `JoinHandle` is simply dropped
    /// rather than awaited, since `Drop` cannot block on it — the spawned
    /// task keeps running to completion on its own after that.
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}
