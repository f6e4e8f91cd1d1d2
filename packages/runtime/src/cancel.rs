//! Hierarchical cooperative cancellation.
//!
//! Tokens form a tree stored in an arena shared by every token derived from the
//! same root. Nodes reference their parent by index. Cancelling a node marks it
//! and all of its descendants in one depth-first pass under the arena lock, so a
//! descendant observed after `cancel` returns is always cancelled.
//!
//! Deadlines are evaluated lazily: a node's effective deadline is the minimum of
//! its own and its ancestors' deadlines, and the first observer past that instant
//! fires the owning node with [`CancelReason::DeadlineExceeded`].

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pipeline_core::{CancelReason, PipelineError};
use tokio::sync::Notify;
use tokio::time::Instant;

type NodeId = usize;

struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    deadline: Option<Instant>,
    reason: Option<CancelReason>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Option<Node>>,
    free: Vec<NodeId>,
}

impl Arena {
    fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    fn insert(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(node);
                id
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    #[cfg(test)]
    fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Ids from `id` up to its root.
    fn path(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            path.push(current);
            cursor = self.get(current).and_then(|n| n.parent);
        }
        path
    }

    fn effective_deadline(&self, id: NodeId) -> Option<Instant> {
        self.path(id)
            .into_iter()
            .filter_map(|n| self.get(n).and_then(|node| node.deadline))
            .min()
    }

    fn add_child(
        &mut self,
        parent: NodeId,
        deadline: Option<Instant>,
        woken: &mut Vec<Arc<Notify>>,
    ) -> NodeId {
        let inherited = self.expire(parent, Instant::now(), woken);
        let child = self.insert(Node {
            parent: Some(parent),
            children: Vec::new(),
            deadline,
            reason: inherited,
            notify: Arc::new(Notify::new()),
        });
        if let Some(node) = self.get_mut(parent) {
            node.children.push(child);
        }
        child
    }

    /// Mark `id` and every descendant cancelled. Already cancelled subtrees are skipped.
    fn cancel(&mut self, id: NodeId, reason: CancelReason, woken: &mut Vec<Arc<Notify>>) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.get_mut(current) else {
                continue;
            };
            if node.reason.is_some() {
                continue;
            }
            node.reason = Some(reason);
            woken.push(node.notify.clone());
            stack.extend(node.children.iter().copied());
        }
    }

    /// Fire any node on the path to the root whose own deadline has passed,
    /// then report the state of `id`.
    fn expire(
        &mut self,
        id: NodeId,
        now: Instant,
        woken: &mut Vec<Arc<Notify>>,
    ) -> Option<CancelReason> {
        for ancestor in self.path(id).into_iter().rev() {
            let due = self.get(ancestor).is_some_and(|node| {
                node.reason.is_none() && node.deadline.is_some_and(|at| at <= now)
            });
            if due {
                self.cancel(ancestor, CancelReason::DeadlineExceeded, woken);
            }
        }
        self.get(id).and_then(|node| node.reason)
    }

    /// Free a node nobody holds anymore. Its children are re-attached to its
    /// parent and inherit its deadline so their effective deadline is unchanged.
    fn release(&mut self, id: NodeId) {
        let Some(node) = self.slots.get_mut(id).and_then(Option::take) else {
            return;
        };
        for &child in &node.children {
            if let Some(child_node) = self.get_mut(child) {
                child_node.parent = node.parent;
                child_node.deadline = match (child_node.deadline, node.deadline) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
        }
        if let Some(parent) = node.parent.and_then(|p| self.get_mut(p)) {
            parent.children.retain(|&c| c != id);
            parent.children.extend(node.children.iter().copied());
        }
        self.free.push(id);
    }
}

type Tree = Mutex<Arena>;

fn lock(tree: &Tree) -> MutexGuard<'_, Arena> {
    tree.lock().unwrap_or_else(PoisonError::into_inner)
}

fn wake(woken: Vec<Arc<Notify>>) {
    for notify in woken {
        notify.notify_waiters();
    }
}

/// Owning reference to one arena slot; the slot is released when the last
/// token or handle pointing at it is dropped.
struct NodeRef {
    tree: Arc<Tree>,
    id: NodeId,
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        lock(&self.tree).release(self.id);
    }
}

/// A cooperative cancellation signal that can be derived into child tokens.
#[derive(Clone)]
pub struct CancellationToken {
    node: Arc<NodeRef>,
}

/// Cancels the token it was created with (and its descendants).
#[derive(Clone)]
pub struct CancelHandle {
    node: Arc<NodeRef>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        cancel_node(&self.node, CancelReason::Cancelled);
    }
}

fn cancel_node(node: &NodeRef, reason: CancelReason) {
    let mut woken = Vec::new();
    lock(&node.tree).cancel(node.id, reason, &mut woken);
    wake(woken);
}

impl CancellationToken {
    /// Create a new root token with no deadline.
    pub fn new() -> Self {
        let tree: Arc<Tree> = Arc::new(Mutex::new(Arena::default()));
        let id = lock(&tree).insert(Node {
            parent: None,
            children: Vec::new(),
            deadline: None,
            reason: None,
            notify: Arc::new(Notify::new()),
        });
        Self {
            node: Arc::new(NodeRef { tree, id }),
        }
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        let mut woken = Vec::new();
        let id = lock(&self.node.tree).add_child(self.node.id, deadline, &mut woken);
        wake(woken);
        Self {
            node: Arc::new(NodeRef {
                tree: self.node.tree.clone(),
                id,
            }),
        }
    }

    /// Derive a child that is cancelled whenever this token is.
    pub fn child(&self) -> Self {
        self.derive(None)
    }

    /// Derive a child together with a handle that cancels only the child subtree.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let child = self.derive(None);
        let handle = CancelHandle {
            node: child.node.clone(),
        };
        (child, handle)
    }

    /// Derive a child that fires at `deadline` (or earlier if an ancestor does).
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        self.derive(Some(deadline))
    }

    /// Derive a child that fires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.derive(Some(Instant::now() + timeout))
    }

    /// Derive a child that also fires when `other` fires, for as long as the
    /// returned guard is alive. `other` may belong to a different tree.
    pub fn linked(&self, other: &CancellationToken) -> (Self, LinkGuard) {
        let (child, handle) = self.with_cancel();
        if Arc::ptr_eq(&self.node, &other.node) {
            return (child, LinkGuard { watcher: None });
        }
        if let Some(reason) = other.err() {
            cancel_node(&handle.node, reason);
            return (child, LinkGuard { watcher: None });
        }

        let other = other.clone();
        let watched = child.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                reason = other.cancelled() => cancel_node(&handle.node, reason),
                _ = watched.cancelled() => {}
            }
        });
        (child, LinkGuard { watcher: Some(watcher) })
    }

    /// Cancel this token and all of its descendants.
    pub fn cancel(&self) {
        cancel_node(&self.node, CancelReason::Cancelled);
    }

    /// Why the token fired, or `None` while it is still live.
    pub fn err(&self) -> Option<CancelReason> {
        let mut woken = Vec::new();
        let reason = lock(&self.node.tree).expire(self.node.id, Instant::now(), &mut woken);
        wake(woken);
        reason
    }

    pub fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }

    /// Effective deadline: the earliest deadline on the path to the root.
    pub fn deadline(&self) -> Option<Instant> {
        lock(&self.node.tree).effective_deadline(self.node.id)
    }

    /// Wait until the token fires.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let (notify, deadline) = {
                let mut woken = Vec::new();
                let mut arena = lock(&self.node.tree);
                let fired = arena.expire(self.node.id, Instant::now(), &mut woken);
                let state = arena
                    .get(self.node.id)
                    .map(|node| (node.notify.clone(), arena.effective_deadline(self.node.id)));
                drop(arena);
                wake(woken);
                match (fired, state) {
                    (Some(reason), _) => return reason,
                    (None, None) => return CancelReason::Cancelled,
                    (None, Some(state)) => state,
                }
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(reason) = self.err() {
                return reason;
            }

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Run `fut` unless the token fires first.
    pub async fn run_until_cancelled<F: Future>(&self, fut: F) -> Result<F::Output, PipelineError> {
        tokio::select! {
            biased;
            reason = self.cancelled() => Err(reason.into()),
            output = fut => Ok(output),
        }
    }

    #[cfg(test)]
    fn live_nodes(&self) -> usize {
        lock(&self.node.tree).live()
    }
}

/// Keeps a [`CancellationToken::linked`] token attached to its second parent.
pub struct LinkGuard {
    watcher: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        if let Some(watcher) = &self.watcher {
            watcher.abort();
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("node", &self.node.id)
            .field("err", &self.err())
            .finish()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("node", &self.node.id)
            .finish()
    }
}
