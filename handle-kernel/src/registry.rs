//! Concurrent handle-key to [`HandleContext`] map and the registration /
//! destruction protocol.

use std::sync::{Arc, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use handle_primitives::{
    Destructor, ErrorSink, HandleClass, HandleError, HandleId, HandleKey, HandleResult,
    TracingErrorSink,
};
use tracing::{debug, warn};

use crate::agent::{Agent, AgentConfig, AgentResult};
use crate::context::HandleContext;

/// Configuration for a [`Registry`] instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryConfig {
    agent: AgentConfig,
}

impl RegistryConfig {
    /// Creates a registry configuration wrapping the given agent tunables.
    #[must_use]
    pub const fn new(agent: AgentConfig) -> Self {
        Self { agent }
    }

    /// Returns the agent configuration.
    #[must_use]
    pub const fn agent(self) -> AgentConfig {
        self.agent
    }
}

/// Concurrent mapping from [`HandleKey`] to [`HandleContext`], and the
/// registration/destruction protocol built on top of it. Always lives
/// behind an `Arc`: the unregistration agent holds a weak reference back
/// to it so that destruction can call back into `remove_and_destroy_handle`
/// from its own consumer task.
pub struct Registry {
    contexts: DashMap<HandleKey, Arc<HandleContext>>,
    agent: Agent,
    error_sink: RwLock<Arc<dyn ErrorSink>>,
}

impl Registry {
    /// Constructs a registry and starts its unregistration agent.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            contexts: DashMap::new(),
            agent: Agent::spawn(weak.clone(), config.agent()),
            error_sink: RwLock::new(Arc::new(TracingErrorSink)),
        })
    }

    /// Replaces the error-sink callback invoked for every failure
    /// encountered during asynchronous destruction.
    pub fn set_error_sink(&self, sink: Arc<dyn ErrorSink>) {
        *self.error_sink.write().expect("registry poisoned") = sink;
    }

    pub(crate) fn report_error(&self, key: &HandleKey, error: &HandleError) {
        self.error_sink
            .read()
            .expect("registry poisoned")
            .on_error(key, error);
    }

    /// Returns the number of handles currently tracked. Intended for tests
    /// and diagnostics, not for making registration decisions (the count
    /// can change the instant it is observed).
    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Returns `true` if no handles are currently tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Ensures `(class, id)` is tracked and contributes one strong
    /// reference to it. Returns the refcount the context holds
    /// immediately after this call.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::InvalidRefCount`] if a concurrent destroyer
    /// left the context in an illegal state, or an error from linking
    /// `dependencies` (each of which must already be registered).
    pub fn register(
        &self,
        class: impl Into<HandleClass>,
        id: HandleId,
        destructor: Option<Destructor>,
        dependencies: Option<Vec<HandleKey>>,
    ) -> HandleResult<i64> {
        let key = HandleKey::new(class, id);

        loop {
            match self.contexts.entry(key.clone()) {
                Entry::Vacant(vacant) => {
                    let ctx = Arc::new(HandleContext::new(destructor));
                    vacant.insert(Arc::clone(&ctx));
                    debug!(handle = %key, "registered new handle context");
                    self.link_dependencies(&key, &ctx, dependencies.as_deref())?;
                    return Ok(1);
                }
                Entry::Occupied(occupied) => {
                    let ctx = Arc::clone(occupied.get());
                    drop(occupied);

                    let new_count = ctx.add_ref();
                    if new_count <= 0 {
                        return Err(HandleError::InvalidRefCount {
                            key,
                            value: new_count,
                        });
                    }
                    if new_count == 1 {
                        // The context was transitioning through zero on another
                        // thread; our increment revived it but the destroyer has
                        // not yet removed it from the map. Do not use it — spin
                        // until it is gone, then retry registration from scratch.
                        warn!(handle = %key, "register raced a destroying context; entering revival spin");
                        while self
                            .contexts
                            .get(&key)
                            .is_some_and(|entry| Arc::ptr_eq(entry.value(), &ctx))
                        {
                            std::thread::yield_now();
                        }
                        continue;
                    }

                    // Legitimate reuse: latest-writer-wins on the destructor,
                    // even when it is `None`.
                    ctx.set_destructor(destructor);
                    debug!(handle = %key, refcount = new_count, "reused existing handle context");
                    self.link_dependencies(&key, &ctx, dependencies.as_deref())?;
                    return Ok(new_count);
                }
            }
        }
    }

    fn link_dependencies(
        &self,
        parent_key: &HandleKey,
        parent_ctx: &HandleContext,
        dependencies: Option<&[HandleKey]>,
    ) -> HandleResult<()> {
        let Some(dependencies) = dependencies else {
            return Ok(());
        };
        for dep in dependencies {
            self.link_dependency_edge(parent_key, parent_ctx, dep)?;
        }
        Ok(())
    }

    fn link_dependency_edge(
        &self,
        parent_key: &HandleKey,
        parent_ctx: &HandleContext,
        dep: &HandleKey,
    ) -> HandleResult<()> {
        let dep_ctx = self
            .contexts
            .get(dep)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| HandleError::ObjectNotFound(dep.clone()))?;

        if parent_ctx.add_dependency(dep.clone()) {
            dep_ctx.add_ref();
            debug!(parent = %parent_key, dep = %dep, "added dependency edge");
        }
        Ok(())
    }

    /// Adds an explicit, post-registration dependency edge from `parent`
    /// to `dep`, pinning `dep` with one additional reference if the edge
    /// is newly inserted.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::ObjectNotFound`] if either `parent` or `dep`
    /// is not currently registered.
    pub fn add_dependency(&self, parent: HandleKey, dep: HandleKey) -> HandleResult<()> {
        let parent_ctx = self
            .contexts
            .get(&parent)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| HandleError::ObjectNotFound(parent.clone()))?;

        self.link_dependency_edge(&parent, &parent_ctx, &dep)
    }

    /// Removes an explicit dependency edge and enqueues a release of
    /// `dep`. The release is asynchronous, not a synchronous decrement:
    /// it goes through the same unregistration agent as
    /// [`Registry::unregister`].
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::ObjectNotFound`] if `parent` is not
    /// registered, or [`HandleError::DependencyNotFound`] if `parent` has
    /// no edge to `dep`.
    pub fn remove_dependency(&self, parent: HandleKey, dep: HandleKey) -> HandleResult<()> {
        let parent_ctx = self
            .contexts
            .get(&parent)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| HandleError::ObjectNotFound(parent.clone()))?;

        if !parent_ctx.has_dependency(&dep) {
            return Err(HandleError::DependencyNotFound {
                parent: parent.clone(),
                dep: dep.clone(),
            });
        }

        parent_ctx.remove_dependency(&dep);
        debug!(parent = %parent, dep = %dep, "removed dependency edge");

        if let Err(err) = self.agent.enqueue(dep.clone()) {
            warn!(handle = %dep, error = %err, "could not enqueue dependency release; agent is stopped");
        }
        Ok(())
    }

    /// Enqueues a release of `(class, id)` onto the unregistration agent
    /// and returns immediately. Does not look up the key; an unknown key
    /// surfaces as [`HandleError::ObjectNotFound`] routed to the error
    /// sink when the agent drains the request, not here.
    ///
    /// # Errors
    ///
    /// Returns [`crate::agent::AgentError::Stopped`] if the agent has
    /// already been stopped.
    pub fn unregister(&self, class: impl Into<HandleClass>, id: HandleId) -> AgentResult<()> {
        self.agent.enqueue(HandleKey::new(class, id))
    }

    /// Invoked only by the unregistration agent's consumer task: performs
    /// one step of the destruction protocol for `key`.
    pub(crate) fn remove_and_destroy_handle(&self, key: &HandleKey) -> HandleResult<()> {
        let ctx = self
            .contexts
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| HandleError::ObjectNotFound(key.clone()))?;

        let refcount = ctx.release();
        if refcount > 0 {
            debug!(handle = %key, refcount, "released handle, still live");
            return Ok(());
        }
        if refcount < 0 {
            return Err(HandleError::InvalidRefCount {
                key: key.clone(),
                value: refcount,
            });
        }

        // refcount == 0: destroy. The destructor's own error is routed to
        // the sink directly rather than returned, so it can never skip the
        // remaining cleanup below.
        if let Err(source) = ctx.run_destructor(key.id()) {
            let error = HandleError::DestructorFailure {
                key: key.clone(),
                source,
            };
            self.report_error(key, &error);
        }

        // Snapshot dependency keys before touching the map again: the set
        // itself cannot be mutated concurrently once refcount is 0 (no
        // other thread can be holding a live reference that would add or
        // remove edges), but cloning first keeps teardown failure-tolerant
        // regardless.
        for dep in ctx.dependency_snapshot() {
            if let Err(err) = self.agent.enqueue(dep.clone()) {
                warn!(handle = %dep, error = %err, "could not enqueue dependency release during teardown");
            }
        }

        let removed = self
            .contexts
            .remove_if(key, |_, stored| Arc::ptr_eq(stored, &ctx));
        if removed.is_none() {
            return Err(HandleError::FailedObjectRemoval(key.clone()));
        }

        debug!(handle = %key, "destroyed and removed handle context");
        Ok(())
    }

    /// Idempotent graceful shutdown of the unregistration agent: drains
    /// everything already queued, then returns. After this resolves, no
    /// further destructors will run.
    pub async fn stop_agent(&self) {
        self.agent.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_destructor(counter: &Arc<AtomicUsize>) -> Destructor {
        let counter = Arc::clone(counter);
        Arc::new(move |_id| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn simple_round_trip_destroys_once() {
        let registry = Registry::new(RegistryConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        registry
            .register(
                HandleClass::new("F"),
                1,
                Some(counting_destructor(&calls)),
                None,
            )
            .unwrap();
        registry.unregister(HandleClass::new("F"), 1).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
        registry.stop_agent().await;
    }

    #[tokio::test]
    async fn shared_handle_keeps_latest_destructor() {
        let registry = Registry::new(RegistryConfig::default());
        let calls_1 = Arc::new(AtomicUsize::new(0));
        let calls_2 = Arc::new(AtomicUsize::new(0));

        registry
            .register(
                HandleClass::new("F"),
                1,
                Some(counting_destructor(&calls_1)),
                None,
            )
            .unwrap();
        registry
            .register(
                HandleClass::new("F"),
                1,
                Some(counting_destructor(&calls_2)),
                None,
            )
            .unwrap();

        registry.unregister(HandleClass::new("F"), 1).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls_1.load(Ordering::SeqCst), 0);
        assert_eq!(calls_2.load(Ordering::SeqCst), 0);
        assert!(!registry.is_empty());

        registry.unregister(HandleClass::new("F"), 1).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls_2.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
        registry.stop_agent().await;
    }

    #[tokio::test]
    async fn dependency_cascade_destroys_parent_then_child() {
        let registry = Registry::new(RegistryConfig::default());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let order_a = Arc::clone(&order);
        registry
            .register(HandleClass::new("F"), 100, None, None)
            .unwrap(); // "b"
        let b_key = HandleKey::new("F", 100);

        let destructor_a: Destructor = Arc::new(move |_id| {
            order_a.lock().unwrap().push("a");
            Ok(())
        });
        registry
            .register(
                HandleClass::new("F"),
                200,
                Some(destructor_a),
                Some(vec![b_key.clone()]),
            )
            .unwrap();

        assert_eq!(
            registry
                .contexts
                .get(&b_key)
                .map(|e| e.value().refcount())
                .unwrap(),
            2
        );

        let order_b = Arc::clone(&order);
        let b_ctx = Arc::clone(registry.contexts.get(&b_key).unwrap().value());
        b_ctx.set_destructor(Some(Arc::new(move |_id| {
            order_b.lock().unwrap().push("b");
            Ok(())
        })));

        registry.unregister(HandleClass::new("F"), 200).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The cascade from "a"'s destruction only released the dependency
        // edge's contribution to "b"'s refcount (2 -> 1); "b" still carries
        // its own original registration reference, so it is not destroyed
        // yet: pinning survives exactly as long as the edge did, no more,
        // no less. Releasing that last reference finishes teardown.
        assert_eq!(&*order.lock().unwrap(), &["a"]);
        assert!(!registry.is_empty());

        registry.unregister(HandleClass::new("F"), 100).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(&*order.lock().unwrap(), &["a", "b"]);
        assert!(registry.is_empty());
        registry.stop_agent().await;
    }

    #[tokio::test]
    async fn stop_drains_cascaded_dependency_release_queued_behind_the_shutdown_sentinel() {
        let registry = Registry::new(RegistryConfig::default());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        registry
            .register(HandleClass::new("F"), 100, None, None)
            .unwrap(); // "b"
        let b_key = HandleKey::new("F", 100);

        let order_b = Arc::clone(&order);
        let b_ctx = Arc::clone(registry.contexts.get(&b_key).unwrap().value());
        b_ctx.set_destructor(Some(Arc::new(move |_id| {
            order_b.lock().unwrap().push("b");
            Ok(())
        })));

        let order_a = Arc::clone(&order);
        let destructor_a: Destructor = Arc::new(move |_id| {
            order_a.lock().unwrap().push("a");
            Ok(())
        });
        registry
            .register(
                HandleClass::new("F"),
                200,
                Some(destructor_a),
                Some(vec![b_key.clone()]),
            )
            .unwrap();

        // Release both "a" and "b"'s own registration reference, then call
        // `stop_agent` immediately with no sleep in between: the queue is
        // [Release(a), Release(b), Shutdown] at the moment the consumer
        // starts draining. Processing Release(a) destroys it and cascades
        // a release of the dependency edge onto "b", which lands *behind*
        // the already-sent `Shutdown` sentinel. Without the trailing drain
        // pass this cascaded release would be abandoned and "b" would leak.
        registry.unregister(HandleClass::new("F"), 200).unwrap();
        registry.unregister(HandleClass::new("F"), 100).unwrap();
        registry.stop_agent().await;

        assert_eq!(&*order.lock().unwrap(), &["a", "b"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn add_dependency_on_missing_target_fails_and_leaves_parent_unchanged() {
        let registry = Registry::new(RegistryConfig::default());
        registry
            .register(HandleClass::new("F"), 1, None, None)
            .unwrap();
        let a = HandleKey::new("F", 1);
        let b = HandleKey::new("F", 2);

        let err = registry.add_dependency(a.clone(), b.clone()).unwrap_err();
        assert!(matches!(err, HandleError::ObjectNotFound(ref k) if *k == b));
        assert_eq!(
            registry
                .contexts
                .get(&a)
                .map(|e| e.value().refcount())
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn destructor_error_is_isolated_per_handle() {
        use std::sync::Mutex;

        let registry = Registry::new(RegistryConfig::default());
        let errors: Arc<Mutex<Vec<HandleKey>>> = Arc::new(Mutex::new(Vec::new()));
        let errors_sink = Arc::clone(&errors);

        struct CollectingSink(Arc<Mutex<Vec<HandleKey>>>);
        impl ErrorSink for CollectingSink {
            fn on_error(&self, key: &HandleKey, _error: &HandleError) {
                self.0.lock().unwrap().push(key.clone());
            }
        }
        registry.set_error_sink(Arc::new(CollectingSink(errors_sink)));

        let calls_2 = Arc::new(AtomicUsize::new(0));
        let destructor_1: Destructor = Arc::new(|_id| anyhow::bail!("boom"));
        registry
            .register(HandleClass::new("F"), 1, Some(destructor_1), None)
            .unwrap();
        registry
            .register(
                HandleClass::new("F"),
                2,
                Some(counting_destructor(&calls_2)),
                None,
            )
            .unwrap();

        registry.unregister(HandleClass::new("F"), 1).unwrap();
        registry.unregister(HandleClass::new("F"), 2).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(calls_2.load(Ordering::SeqCst), 1);
        assert_eq!(errors.lock().unwrap().as_slice(), &[HandleKey::new("F", 1)]);
        assert!(registry.is_empty());
        registry.stop_agent().await;
    }
}
