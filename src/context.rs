//! Per-context nesting state.
//!
//! Every logical execution context (a tokio task, or a thread outside any
//! task) gets at most one entry: the connection it holds, the scopes open on
//! it, whether the first one began a transaction and whether that transaction
//! can still commit. An absent entry means depth 0 and no pool resource held.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

/// Identity of a logical execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKey {
    Task(tokio::task::Id),
    Thread(ThreadId),
    /// Caller-managed context, see [`ContextKey::unique`].
    Explicit(u64),
}

static NEXT_EXPLICIT: AtomicU64 = AtomicU64::new(1);

impl ContextKey {
    /// The calling task, or the calling thread when not inside a task.
    #[must_use]
    pub fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => ContextKey::Task(id),
            None => ContextKey::Thread(thread::current().id()),
        }
    }

    /// A fresh key no other context uses.
    #[must_use]
    pub fn unique() -> Self {
        ContextKey::Explicit(NEXT_EXPLICIT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextKey::Task(id) => write!(f, "task {id}"),
            ContextKey::Thread(id) => write!(f, "{id:?}"),
            ContextKey::Explicit(id) => write!(f, "context {id}"),
        }
    }
}

struct Entry<C> {
    connection: Arc<C>,
    /// Depths of the scopes still open, outermost first.
    open: Vec<usize>,
    in_transaction: bool,
    /// Set once the transaction can no longer commit.
    aborted: Option<String>,
}

impl<C> Entry<C> {
    fn push_scope(&mut self) -> usize {
        let depth = self.open.last().map_or(1, |last| last + 1);
        self.open.push(depth);
        depth
    }
}

/// Result of installing a freshly checked-out connection.
#[derive(Debug)]
pub(crate) enum Installed<C> {
    /// The context was idle; it now holds `connection` at depth 1.
    New,
    /// Another scope of the same context got there first; the offered
    /// connection was not used and comes back to the caller.
    Joined { unused: Arc<C>, depth: usize },
}

/// What the caller must do after leaving a scope.
#[derive(Debug)]
pub(crate) enum Release<C> {
    /// Left the innermost scope; this many scopes stay open.
    Nested(usize),
    /// Left a scope that still has open inner scopes. The transaction is
    /// now rollback-only.
    OutOfOrder { depth: usize, open: usize },
    /// Depth reached 0; the caller finalizes and drops the connection.
    Outermost(Finalize<C>),
    /// The context had no open scope.
    Missing,
}

#[derive(Debug)]
pub(crate) struct Finalize<C> {
    pub(crate) connection: Arc<C>,
    pub(crate) in_transaction: bool,
    pub(crate) aborted: Option<String>,
}

/// Lock-protected table of per-context state. Contexts never see each
/// other's entries.
pub(crate) struct ContextRegistry<C> {
    entries: Mutex<HashMap<ContextKey, Entry<C>>>,
}

impl<C> Default for ContextRegistry<C> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<C> ContextRegistry<C> {
    fn lock(&self) -> MutexGuard<'_, HashMap<ContextKey, Entry<C>>> {
        // The table stays consistent across a panic; no update spans an
        // await or a user callback.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Enter a nested scope if the context is active. Returns the shared
    /// connection and the new scope's depth.
    pub(crate) fn reenter(&self, key: ContextKey) -> Option<(Arc<C>, usize)> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&key)?;
        let depth = entry.push_scope();
        Some((Arc::clone(&entry.connection), depth))
    }

    /// Record a newly acquired connection for an idle context.
    pub(crate) fn install(
        &self,
        key: ContextKey,
        connection: Arc<C>,
        in_transaction: bool,
    ) -> Installed<C> {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&key) {
            return Installed::Joined {
                unused: connection,
                depth: entry.push_scope(),
            };
        }
        entries.insert(
            key,
            Entry {
                connection,
                open: vec![1],
                in_transaction,
                aborted: None,
            },
        );
        Installed::New
    }

    /// Leave the scope entered at `depth`.
    pub(crate) fn release(&self, key: ContextKey, depth: usize) -> Release<C> {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&key) else {
            return Release::Missing;
        };
        let Some(pos) = entry.open.iter().position(|&open| open == depth) else {
            return Release::Missing;
        };
        entry.open.remove(pos);
        if pos < entry.open.len() {
            if entry.in_transaction && entry.aborted.is_none() {
                entry.aborted = Some(format!("scope at depth {depth} exited before its inner scopes"));
            }
            return Release::OutOfOrder {
                depth,
                open: entry.open.len(),
            };
        }
        if !entry.open.is_empty() {
            return Release::Nested(entry.open.len());
        }
        match entries.remove(&key) {
            Some(entry) => Release::Outermost(Finalize {
                connection: entry.connection,
                in_transaction: entry.in_transaction,
                aborted: entry.aborted,
            }),
            None => Release::Missing,
        }
    }

    /// Make the context's open transaction rollback-only. The first reason
    /// recorded is kept.
    pub(crate) fn mark_aborted(&self, key: ContextKey, reason: impl FnOnce() -> String) {
        if let Some(entry) = self.lock().get_mut(&key)
            && entry.in_transaction
            && entry.aborted.is_none()
        {
            entry.aborted = Some(reason());
        }
    }

    pub(crate) fn is_aborted(&self, key: ContextKey) -> bool {
        self.lock()
            .get(&key)
            .is_some_and(|entry| entry.aborted.is_some())
    }

    /// Connection held by the context, and whether a transaction is open on it.
    pub(crate) fn current(&self, key: ContextKey) -> Option<(Arc<C>, bool)> {
        self.lock()
            .get(&key)
            .map(|entry| (Arc::clone(&entry.connection), entry.in_transaction))
    }

    /// Number of scopes the context has open.
    pub(crate) fn depth(&self, key: ContextKey) -> usize {
        self.lock().get(&key).map_or(0, |entry| entry.open.len())
    }

    /// Number of contexts currently holding a connection.
    pub(crate) fn active(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_scopes_share_one_connection_and_finalize_once() {
        let registry = ContextRegistry::default();
        let key = ContextKey::unique();
        assert!(registry.reenter(key).is_none());
        assert!(matches!(
            registry.install(key, Arc::new("conn"), true),
            Installed::New
        ));

        let (shared, depth) = registry.reenter(key).unwrap();
        assert_eq!(*shared, "conn");
        assert_eq!(depth, 2);
        assert_eq!(registry.reenter(key).unwrap().1, 3);

        assert!(matches!(registry.release(key, 3), Release::Nested(2)));
        assert!(matches!(registry.release(key, 2), Release::Nested(1)));
        match registry.release(key, 1) {
            Release::Outermost(finalize) => {
                assert!(finalize.in_transaction);
                assert!(finalize.aborted.is_none());
                assert_eq!(*finalize.connection, "conn");
            }
            other => panic!("expected outermost release, got {other:?}"),
        }
        assert!(matches!(registry.release(key, 1), Release::Missing));
        assert_eq!(registry.depth(key), 0);
    }

    #[test]
    fn contexts_are_isolated() {
        let registry = ContextRegistry::default();
        let a = ContextKey::unique();
        let b = ContextKey::unique();
        registry.install(a, Arc::new(1), false);
        registry.install(b, Arc::new(2), true);
        assert_eq!(registry.active(), 2);

        assert_eq!(*registry.current(a).unwrap().0, 1);
        assert!(!registry.current(a).unwrap().1);
        assert_eq!(*registry.current(b).unwrap().0, 2);

        assert!(matches!(registry.release(a, 1), Release::Outermost(_)));
        assert!(registry.current(a).is_none());
        assert_eq!(registry.depth(b), 1);
    }

    #[test]
    fn racing_install_joins_existing_entry() {
        let registry = ContextRegistry::default();
        let key = ContextKey::unique();
        registry.install(key, Arc::new("first"), true);
        match registry.install(key, Arc::new("second"), true) {
            Installed::Joined { unused, depth } => {
                assert_eq!(*unused, "second");
                assert_eq!(depth, 2);
            }
            Installed::New => panic!("second install must join"),
        }
        assert_eq!(*registry.current(key).unwrap().0, "first");
    }

    #[test]
    fn outer_exit_before_inner_makes_transaction_rollback_only() {
        let registry = ContextRegistry::default();
        let key = ContextKey::unique();
        registry.install(key, Arc::new("conn"), true);
        assert_eq!(registry.reenter(key).unwrap().1, 2);

        assert!(matches!(
            registry.release(key, 1),
            Release::OutOfOrder { depth: 1, open: 1 }
        ));
        assert!(registry.is_aborted(key));
        assert_eq!(registry.depth(key), 1);

        // A scope entered now still nests inside the surviving one.
        assert_eq!(registry.reenter(key).unwrap().1, 3);
        assert!(matches!(registry.release(key, 3), Release::Nested(1)));

        match registry.release(key, 2) {
            Release::Outermost(finalize) => {
                let reason = finalize.aborted.unwrap();
                assert!(reason.contains("depth 1"), "{reason}");
            }
            other => panic!("expected outermost release, got {other:?}"),
        }
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn failures_only_abort_transactions() {
        let registry = ContextRegistry::default();
        let tx = ContextKey::unique();
        let plain = ContextKey::unique();
        registry.install(tx, Arc::new(1), true);
        registry.install(plain, Arc::new(2), false);

        registry.mark_aborted(tx, || "first".to_string());
        registry.mark_aborted(tx, || "second".to_string());
        registry.mark_aborted(plain, || "ignored".to_string());
        assert!(!registry.is_aborted(plain));

        match registry.release(tx, 1) {
            Release::Outermost(finalize) => assert_eq!(finalize.aborted.as_deref(), Some("first")),
            other => panic!("expected outermost release, got {other:?}"),
        }
    }

    #[test]
    fn current_key_outside_runtime_is_thread() {
        assert!(matches!(ContextKey::current(), ContextKey::Thread(_)));
        assert_ne!(ContextKey::unique(), ContextKey::unique());
    }

    #[tokio::test]
    async fn spawned_tasks_get_distinct_keys() {
        let a = tokio::spawn(async { ContextKey::current() }).await.unwrap();
        let b = tokio::spawn(async { ContextKey::current() }).await.unwrap();
        assert!(matches!(a, ContextKey::Task(_)));
        assert_ne!(a, b);
    }
}
