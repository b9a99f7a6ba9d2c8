//! Mount path → Route map with atomic swap semantics. See `SPEC_FULL.md`
//! §4.4 and §9 ("explicit route table with an atomic swap primitive").

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::auth::AuthConfig;
use crate::child_session::ChildSession;
use crate::error::RouteTableError;
use crate::http_session::SessionTable;

/// A single mounted server: its child session, its own HTTP session
/// table, and (optionally) the auth config guarding it. `ChildSession`'s
/// own methods are already safe for concurrent callers — request/response
/// pairs are correlated by id — so no outer lock serializes requests to
/// the same route.
pub struct Route {
    pub mount_path: String,
    pub server_name: String,
    pub child: ChildSession,
    pub sessions: SessionTable,
    pub auth: Option<Arc<AuthConfig>>,
}

impl Route {
    pub fn new(
        mount_path: String,
        server_name: String,
        child: ChildSession,
        auth: Option<Arc<AuthConfig>>,
    ) -> Self {
        Self {
            mount_path,
            server_name,
            child,
            sessions: SessionTable::new(),
            auth,
        }
    }

    /// Tears down the backing child session. Idempotent.
    pub async fn close(&self) {
        self.child.close().await;
    }
}

type Table = HashMap<String, Arc<Route>>;

/// The mount-path → Route map. Mutated only by the reconfiguration
/// controller; readers take a consistent point-in-time snapshot.
pub struct RouteTable {
    routes: RwLock<Arc<Table>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub async fn lookup(&self, mount_path: &str) -> Option<Arc<Route>> {
        self.routes.read().await.get(mount_path).cloned()
    }

    /// Mounts `route`. Rejects duplicates at `route.mount_path`.
    pub async fn mount(&self, route: Arc<Route>) -> Result<(), RouteTableError> {
        let mut guard = self.routes.write().await;
        if guard.contains_key(&route.mount_path) {
            return Err(RouteTableError::AlreadyMounted(route.mount_path.clone()));
        }
        let mut next = (**guard).clone();
        next.insert(route.mount_path.clone(), route);
        *guard = Arc::new(next);
        Ok(())
    }

    /// Removes and returns the route at `mount_path`. No-op (returns
    /// `None`) if nothing is mounted there. Does not close the returned
    /// route's child session — that is the caller's responsibility.
    pub async fn unmount(&self, mount_path: &str) -> Option<Arc<Route>> {
        let mut guard = self.routes.write().await;
        if !guard.contains_key(mount_path) {
            return None;
        }
        let mut next = (**guard).clone();
        let removed = next.remove(mount_path);
        *guard = Arc::new(next);
        removed
    }

    /// A point-in-time, cheaply-clonable view of the table, for diffing
    /// and as the rollback primitive's restore point.
    pub async fn snapshot(&self) -> Arc<Table> {
        self.routes.read().await.clone()
    }

    /// Atomically replaces the entire table with `snapshot`.
    pub async fn restore(&self, snapshot: Arc<Table>) {
        *self.routes.write().await = snapshot;
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
