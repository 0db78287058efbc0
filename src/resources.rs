//! Resource registry: named dependency nodes that requests block on.
//!
//! A resource is declared, published exactly once (with or without a
//! payload), and requests blocked on it are released the moment it
//! publishes. Payload ownership rides on `Arc<dyn Any + Send + Sync>` and
//! cleanup is just `Arc::drop` once every reader has gone away, mirroring
//! the refcounted registry pattern in `circuit_breaker_registry.rs` but
//! generalized from "named breaker" to "named value with waiters."

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot, Notify};
use tracing::debug;

/// Monotonically increasing resource handle, unique for the lifetime of a
/// [`Registry`] (and, since the counter is process-global, across
/// registries too).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(pub u64);

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

fn next_resource_id() -> ResourceId {
    ResourceId(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
}

/// Opaque payload carried by a published resource node.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// A resource cleanup hook, run after the last reference to a payload is
/// dropped. Most payloads need nothing beyond `Arc::drop`; this exists for
/// the minority that hold an external handle (a temp file, a lease) that
/// wants an explicit teardown call.
pub type CleanupHook = Box<dyn FnOnce() + Send>;

struct Node {
    name: Option<String>,
    published: bool,
    payload: Option<Payload>,
    refcnt: usize,
    failed: bool,
    blocked: VecDeque<u64>,
    cleanup: Option<CleanupHook>,
    auto_release_owner: bool,
}

impl Node {
    /// A node materialized implicitly — by `block_on`, `publish`, or
    /// `autorelease_owner` — before any `declare` ever named it. Spec.md
    /// §4.B: "A node created by `block_on(id)` before any declare is a
    /// placeholder with `refcnt=0`; `addref` bumps it to 1."
    fn placeholder() -> Self {
        Self {
            name: None,
            published: false,
            payload: None,
            refcnt: 0,
            failed: false,
            blocked: VecDeque::new(),
            cleanup: None,
            auto_release_owner: false,
        }
    }

    /// A node created by `declare()`: the declaring owner's own reference is
    /// live from the start (spec.md §4.B: "declare() -> id: creates node
    /// with refcnt=1, no payload").
    fn owned(name: String) -> Self {
        Self { name: Some(name), refcnt: 1, ..Self::placeholder() }
    }
}

/// Message sent over the async inbox so resource operations can be invoked
/// from any task without taking a synchronous lock on the registry.
enum InboxMsg {
    Publish { id: ResourceId, payload: Option<Payload>, reply: oneshot::Sender<()> },
    Register { name: String, reply: oneshot::Sender<ResourceId> },
    Release { id: ResourceId, reply: oneshot::Sender<()> },
}

/// The resource dependency registry.
///
/// Single-writer by convention: the scheduler owns the only `&mut Registry`
/// and drains the inbox once per tick. Other tasks talk to it over the
/// bounded channel returned by [`Registry::inbox`].
pub struct Registry {
    nodes: BTreeMap<ResourceId, Node>,
    names: std::collections::HashMap<String, ResourceId>,
    inbox_rx: mpsc::Receiver<InboxMsg>,
    inbox_tx: mpsc::Sender<InboxMsg>,
    wake: Arc<Notify>,
}

/// Cloneable handle used to publish/register resources from other tasks.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<InboxMsg>,
    wake: Arc<Notify>,
}

const INBOX_CAPACITY: usize = 1024;

impl Registry {
    pub fn new() -> Self {
        Self::with_wake(Arc::new(Notify::new()))
    }

    /// Construct a registry that notifies `wake` whenever an async
    /// publish/register arrives, so the scheduler loop can wake from its
    /// idle sleep instead of waiting out the poll timeout.
    pub fn with_wake(wake: Arc<Notify>) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        Self { nodes: BTreeMap::new(), names: std::collections::HashMap::new(), inbox_rx, inbox_tx, wake }
    }

    /// A cloneable sender for cross-task publish/register calls.
    pub fn handle(&self) -> RegistryHandle {
        RegistryHandle { tx: self.inbox_tx.clone(), wake: self.wake.clone() }
    }

    /// Declare a resource by name, returning its id. Declaring the same
    /// name twice returns the same id; declaring is idempotent and does not
    /// publish anything. The declaring owner holds a live reference from
    /// the start (spec.md §4.B), distinct from the refcnt=0 placeholder a
    /// bare `block_on` creates.
    pub fn declare(&mut self, name: impl Into<String>) -> ResourceId {
        let name = name.into();
        if let Some(id) = self.names.get(&name) {
            return *id;
        }
        let id = next_resource_id();
        self.names.insert(name.clone(), id);
        self.nodes.insert(id, Node::owned(name));
        id
    }

    /// Publish a resource's payload, waking every blocked request. A `None`
    /// payload marks the resource failed; waiters observe
    /// [`crate::error::OrchError::DependencyFailed`].
    ///
    /// Republishing an already-published node (spec.md §4.B) drops the old
    /// payload and installs the new one; the waiter list, already drained
    /// on first publish, is not touched again — late waiters only ever
    /// attach via [`Registry::block_on`], which returns `true` immediately
    /// once `published` is set, so there is nothing left to wake.
    pub fn publish(&mut self, id: ResourceId, payload: Option<Payload>) -> Vec<u64> {
        self.publish_with_cleanup(id, payload, None)
    }

    /// Like [`Registry::publish`] but attaches a cleanup hook run when this
    /// payload is itself replaced by a later republish, or when its
    /// refcount drops to zero via [`Registry::release`].
    pub fn publish_with_cleanup(
        &mut self,
        id: ResourceId,
        payload: Option<Payload>,
        cleanup: Option<CleanupHook>,
    ) -> Vec<u64> {
        let node = self.nodes.entry(id).or_insert_with(Node::placeholder);
        let first_publish = !node.published;

        // spec.md §4.B: "Republish on an existing node first invokes
        // cleanup(old_payload) then installs the new one." The old
        // `Payload` Arc is dropped here too (by the assignment below),
        // running its destructor the moment no other clone is outstanding.
        if let Some(old_cleanup) = node.cleanup.take() {
            old_cleanup();
        }
        node.published = true;
        node.failed = payload.is_none();
        node.payload = payload;
        node.cleanup = cleanup;

        if first_publish {
            node.blocked.drain(..).collect()
        } else {
            debug!(resource_id = id.0, "resource republished, no new waiters to wake");
            Vec::new()
        }
    }

    /// Register (declare + publish in one step) a resource with a payload.
    pub fn register(&mut self, name: impl Into<String>, payload: Payload) -> (ResourceId, Vec<u64>) {
        let id = self.declare(name);
        let waiters = self.publish(id, Some(payload));
        (id, waiters)
    }

    /// Peek at a resource's published payload without adjusting refcount.
    pub fn peek(&self, id: ResourceId) -> Option<&Payload> {
        self.nodes.get(&id).and_then(|n| n.payload.as_ref())
    }

    /// Whether the resource has been published (successfully or not).
    pub fn is_published(&self, id: ResourceId) -> bool {
        self.nodes.get(&id).map(|n| n.published).unwrap_or(false)
    }

    /// Whether the resource published with an absent payload.
    pub fn is_failed(&self, id: ResourceId) -> bool {
        self.nodes.get(&id).map(|n| n.failed).unwrap_or(false)
    }

    /// Record one caller's interest in `id`, returning the live payload if
    /// already published. The refcount tracks interest from the moment
    /// it's registered, not from publish time, so a request that blocks on
    /// a not-yet-published dependency still holds a real reference once
    /// that dependency publishes later.
    pub fn addref(&mut self, id: ResourceId) -> Option<Payload> {
        let node = self.nodes.get_mut(&id)?;
        node.refcnt += 1;
        if node.published && !node.failed {
            node.payload.clone()
        } else {
            None
        }
    }

    /// Decrement refcount; on reaching zero, runs the cleanup hook and
    /// erases the node entirely (spec.md §4.B: "on reaching zero, call
    /// cleanup(payload) and erase node"). If [`Registry::autorelease_owner`]
    /// is enabled for this node and the count would otherwise settle at
    /// exactly the owner's own reference with no one left blocked on it,
    /// the owner ref is dropped too in the same call (spec.md §4.B
    /// `autorelease_owner`).
    pub fn release(&mut self, id: ResourceId) {
        let Some(node) = self.nodes.get_mut(&id) else { return };
        node.refcnt = node.refcnt.saturating_sub(1);
        if node.refcnt == 0 {
            self.erase(id);
        } else if node.auto_release_owner && node.refcnt == 1 && node.blocked.is_empty() {
            self.erase(id);
        }
    }

    /// Run the cleanup hook (if any) and drop `id`'s node, including its
    /// name-to-id mapping if it was ever declared under one.
    fn erase(&mut self, id: ResourceId) {
        if let Some(mut node) = self.nodes.remove(&id) {
            if let Some(cleanup) = node.cleanup.take() {
                cleanup();
            }
            node.payload = None;
            if let Some(name) = &node.name {
                self.names.remove(name);
            }
        }
    }

    /// Bulk [`Registry::addref`] across a request's dependency list, called
    /// by the scheduler exactly once the first time it touches a pending
    /// request (spec.md §4.B).
    pub fn retain_request_deps(&mut self, deps: &[ResourceId]) {
        for &id in deps {
            self.addref(id);
        }
    }

    /// Bulk [`Registry::release`] across a request's dependency list, called
    /// by the scheduler during request destruction (spec.md §4.B).
    pub fn release_request_deps(&mut self, deps: &[ResourceId]) {
        for &id in deps {
            self.release(id);
        }
    }

    /// Enable or disable automatic owner-ref release for `id` (spec.md
    /// §4.B). Declares the node first if it doesn't exist yet, so this can
    /// be called before the owner ever calls `declare`/`register`.
    pub fn autorelease_owner(&mut self, id: ResourceId, enabled: bool) {
        let node = self.nodes.entry(id).or_insert_with(Node::placeholder);
        node.auto_release_owner = enabled;
    }

    /// Convenience wrapper over [`Registry::publish`] for string payloads
    /// (spec.md §6 `res_publish_str`).
    pub fn publish_str(&mut self, id: ResourceId, value: impl Into<String>) -> Vec<u64> {
        self.publish(id, Some(Arc::new(value.into())))
    }

    /// Convenience wrapper over [`Registry::peek`] for string payloads
    /// (spec.md §6 `res_get_str`); `None` if unpublished, failed, or the
    /// payload isn't a `String`.
    pub fn get_str(&self, id: ResourceId) -> Option<String> {
        self.peek(id).and_then(|p| p.downcast_ref::<String>()).cloned()
    }

    /// Register `request_id` as blocked on `id`. Returns `true` if the
    /// caller should proceed synchronously because the resource is already
    /// published (the caller is responsible for not also queuing a wait).
    pub fn block_on(&mut self, id: ResourceId, request_id: u64) -> bool {
        let node = self.nodes.entry(id).or_insert_with(Node::placeholder);
        if node.published {
            true
        } else {
            node.blocked.push_back(request_id);
            false
        }
    }

    /// Check every id in `deps`; if all are published, return `Ok(())`. If
    /// any has failed, returns `Err(id)` of the first failed dependency. If
    /// any is still pending, registers `request_id` as a blocked waiter on
    /// every pending id and returns `Ok(())` with the request left blocked
    /// (caller checks [`Registry::all_ready`] again once woken).
    pub fn check_and_block_list(
        &mut self,
        deps: &[ResourceId],
        request_id: u64,
    ) -> Result<bool, ResourceId> {
        for &id in deps {
            if self.is_failed(id) {
                return Err(id);
            }
        }
        let mut all_ready = true;
        for &id in deps {
            if !self.block_on(id, request_id) {
                all_ready = false;
            }
        }
        Ok(all_ready)
    }

    /// Whether every id in `deps` is published and none has failed.
    pub fn all_ready(&self, deps: &[ResourceId]) -> bool {
        deps.iter().all(|id| self.is_published(*id) && !self.is_failed(*id))
    }

    /// Drain and apply every pending inbox message, returning ids of
    /// requests woken by publishes that happened this drain.
    pub fn drain_inbox(&mut self) -> Vec<u64> {
        let mut woken = Vec::new();
        while let Ok(msg) = self.inbox_rx.try_recv() {
            match msg {
                InboxMsg::Publish { id, payload, reply } => {
                    woken.extend(self.publish(id, payload));
                    let _ = reply.send(());
                }
                InboxMsg::Register { name, reply } => {
                    let id = self.declare(name);
                    let _ = reply.send(id);
                }
                InboxMsg::Release { id, reply } => {
                    self.release(id);
                    let _ = reply.send(());
                }
            }
        }
        woken
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryHandle {
    /// Publish a resource from another task, awaiting registry
    /// acknowledgement (the registry must be draining its inbox for this
    /// to resolve, i.e. the scheduler loop must be running).
    pub async fn publish_async(&self, id: ResourceId, payload: Option<Payload>) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(InboxMsg::Publish { id, payload, reply }).await.is_ok() {
            self.wake.notify_one();
            let _ = rx.await;
        }
    }

    /// Release a reference held on `id` from another task, awaiting registry
    /// acknowledgement (spec.md §4.B `release_async`).
    pub async fn release_async(&self, id: ResourceId) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(InboxMsg::Release { id, reply }).await.is_ok() {
            self.wake.notify_one();
            let _ = rx.await;
        }
    }

    /// Declare (or fetch) a named resource id from another task.
    pub async fn register_async(&self, name: impl Into<String>) -> ResourceId {
        let (reply, rx) = oneshot::channel();
        let name = name.into();
        if self.tx.send(InboxMsg::Register { name, reply }).await.is_ok() {
            self.wake.notify_one();
            if let Ok(id) = rx.await {
                return id;
            }
        }
        // Channel closed (registry dropped): hand back a fresh id anyway so
        // callers keep a stable handle to compare against, even though it
        // will never publish.
        next_resource_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_is_idempotent_by_name() {
        let mut reg = Registry::new();
        let a = reg.declare("db-conn");
        let b = reg.declare("db-conn");
        assert_eq!(a, b);
    }

    #[test]
    fn publish_wakes_blocked_waiters_exactly_once() {
        let mut reg = Registry::new();
        let id = reg.declare("config");
        assert!(!reg.block_on(id, 1));
        assert!(!reg.block_on(id, 2));

        let woken = reg.publish(id, Some(Arc::new(42i32)));
        assert_eq!(woken, vec![1, 2]);

        // A republish (spec.md §4.B) installs the new payload but does not
        // re-wake anyone — the waiter list was already drained above.
        let woken_again = reg.publish(id, Some(Arc::new(7i32)));
        assert!(woken_again.is_empty());
        assert_eq!(reg.peek(id).unwrap().downcast_ref::<i32>(), Some(&7));
    }

    #[test]
    fn republish_runs_old_cleanup_hook_before_installing_new_payload() {
        let mut reg = Registry::new();
        let id = reg.declare("lease");
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_cb = ran.clone();
        reg.publish_with_cleanup(
            id,
            Some(Arc::new(1i32)),
            Some(Box::new(move || ran_cb.store(true, Ordering::SeqCst))),
        );
        assert!(!ran.load(Ordering::SeqCst));

        reg.publish(id, Some(Arc::new(2i32)));
        assert!(ran.load(Ordering::SeqCst), "republish must run the old cleanup hook");
        assert_eq!(reg.peek(id).unwrap().downcast_ref::<i32>(), Some(&2));
    }

    #[test]
    fn publish_with_none_marks_failed() {
        let mut reg = Registry::new();
        let id = reg.declare("token");
        reg.publish(id, None);
        assert!(reg.is_failed(id));
        assert!(reg.peek(id).is_none());
    }

    #[test]
    fn block_on_already_published_returns_true_immediately() {
        let mut reg = Registry::new();
        let id = reg.declare("warm");
        reg.publish(id, Some(Arc::new(1i32)));
        assert!(reg.block_on(id, 99));
    }

    #[test]
    fn check_and_block_list_reports_first_failed_dependency() {
        let mut reg = Registry::new();
        let ok = reg.declare("ok");
        let bad = reg.declare("bad");
        reg.publish(ok, Some(Arc::new(1i32)));
        reg.publish(bad, None);

        let result = reg.check_and_block_list(&[ok, bad], 1);
        assert_eq!(result, Err(bad));
    }

    #[test]
    fn addref_release_drops_payload_at_zero_refcount() {
        let mut reg = Registry::new();
        let id = reg.declare("shared"); // owner ref: refcnt == 1
        reg.publish(id, Some(Arc::new(String::from("v"))));

        assert!(reg.addref(id).is_some()); // refcnt == 2
        assert!(reg.addref(id).is_some()); // refcnt == 3
        reg.release(id); // refcnt == 2
        assert!(reg.peek(id).is_some());
        reg.release(id); // refcnt == 1, still the owner's
        assert!(reg.peek(id).is_some());
        reg.release(id); // refcnt == 0, node erased
        assert!(reg.peek(id).is_none());
    }

    #[test]
    fn autorelease_owner_drops_the_final_ref_once_waiters_are_gone() {
        let mut reg = Registry::new();
        let id = reg.declare("session"); // owner ref: refcnt == 1
        reg.autorelease_owner(id, true);
        reg.publish(id, Some(Arc::new(1i32)));

        reg.addref(id); // a dependent's ref: refcnt == 2
        assert!(reg.peek(id).is_some());

        // Dependent releases; only the owner ref remains and no one is
        // blocked, so autorelease_owner drops it too in the same call.
        reg.release(id);
        assert!(reg.peek(id).is_none(), "owner ref should have auto-released");
    }

    #[test]
    fn autorelease_owner_waits_for_blocked_waiters_to_drain_first() {
        let mut reg = Registry::new();
        let id = reg.declare("session"); // owner ref: refcnt == 1
        reg.autorelease_owner(id, true);
        assert!(!reg.block_on(id, 7)); // a waiter is still pending first publish
        reg.addref(id); // a second, short-lived ref: refcnt == 2
        reg.release(id); // back down to refcnt == 1, but a waiter remains blocked

        // If autorelease had fired here, the node would be gone and a later
        // publish would re-declare it from scratch with an empty blocked
        // list — the original waiter (7) would never be woken. It must
        // still be there.
        let woken = reg.publish(id, Some(Arc::new(9i32)));
        assert_eq!(woken, vec![7], "the still-blocked waiter must survive the release");
        assert!(reg.peek(id).is_some());
    }

    #[test]
    fn publish_str_and_get_str_round_trip() {
        let mut reg = Registry::new();
        let id = reg.declare("api-key");
        reg.publish_str(id, "sk-test-123");
        assert_eq!(reg.get_str(id).as_deref(), Some("sk-test-123"));
    }

    #[test]
    fn get_str_is_none_for_non_string_payload() {
        let mut reg = Registry::new();
        let id = reg.declare("count");
        reg.publish(id, Some(Arc::new(42i32)));
        assert_eq!(reg.get_str(id), None);
    }

    #[test]
    fn retain_and_release_request_deps_are_bulk_addref_release() {
        let mut reg = Registry::new();
        let a = reg.declare("a");
        let b = reg.declare("b");
        // Without an owner sticking around to release its own ref, bulk
        // dependency release alone would only bring these back down to the
        // owner's ref (refcnt == 1), not zero — enable autorelease so the
        // request's release also drops the owner's.
        reg.autorelease_owner(a, true);
        reg.autorelease_owner(b, true);
        reg.publish(a, Some(Arc::new(1i32)));
        reg.publish(b, Some(Arc::new(2i32)));

        reg.retain_request_deps(&[a, b]);
        assert!(reg.peek(a).is_some());
        assert!(reg.peek(b).is_some());

        reg.release_request_deps(&[a, b]);
        assert!(reg.peek(a).is_none());
        assert!(reg.peek(b).is_none());
    }

    #[tokio::test]
    async fn async_publish_through_inbox_wakes_blocked_request() {
        let mut reg = Registry::new();
        let id = reg.declare("async-dep");
        assert!(!reg.block_on(id, 5));

        let handle = reg.handle();
        let publish_task = tokio::spawn(async move {
            handle.publish_async(id, Some(Arc::new(10i32))).await;
        });

        // Give the task a chance to enqueue, then drain manually (the real
        // scheduler drains every tick).
        tokio::task::yield_now().await;
        let mut woken = Vec::new();
        for _ in 0..50 {
            woken = reg.drain_inbox();
            if !woken.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        publish_task.await.unwrap();
        assert_eq!(woken, vec![5]);
    }
}
