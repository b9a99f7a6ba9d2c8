//! Diff/apply/rollback of the route table against a new `Config`. See
//! `SPEC_FULL.md` §4.5 and the prepare/commit redesign note in §9.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::auth::AuthConfig;
use crate::child_session::ChildSession;
use crate::config::Config;
use crate::error::ReloadError;
use crate::route_table::{Route, RouteTable};

pub struct ReconcileController {
    table: Arc<RouteTable>,
    current: Mutex<Config>,
    path_prefix: String,
    handshake_timeout: Duration,
    auth: Option<Arc<AuthConfig>>,
}

pub fn mount_path(path_prefix: &str, server_name: &str) -> String {
    format!("{path_prefix}{server_name}/mcp")
}

impl ReconcileController {
    pub fn new(
        table: Arc<RouteTable>,
        initial: Config,
        path_prefix: String,
        handshake_timeout: Duration,
        auth: Option<Arc<AuthConfig>>,
    ) -> Self {
        Self {
            table,
            current: Mutex::new(initial),
            path_prefix,
            handshake_timeout,
            auth,
        }
    }

    /// Mounts every server in the controller's initial config. Used once
    /// at startup; unlike `apply`, there is no prior table state to roll
    /// back to on partial failure, so this surfaces a composite error
    /// naming every server whose spawn failed and mounts the rest.
    pub async fn mount_initial(&self) -> Result<(), anyhow::Error> {
        let config = self.current.lock().await;
        let mut failures = Vec::new();
        for (name, spec) in &config.servers {
            match ChildSession::start(name, spec, self.handshake_timeout).await {
                Ok(child) => {
                    let route = Arc::new(Route::new(
                        mount_path(&self.path_prefix, name),
                        name.clone(),
                        child,
                        self.auth.clone(),
                    ));
                    if self.table.mount(route).await.is_err() {
                        failures.push(format!("{name}: duplicate mount path"));
                    }
                }
                Err(error) => failures.push(format!("{name}: {error}")),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "failed to start {} server(s): {}",
                failures.len(),
                failures.join("; ")
            ))
        }
    }

    /// Diffs `new_config` against the currently-applied config, tears down
    /// removed/changed routes, prepares fresh child sessions for
    /// added/changed routes, and only mutates the live table once every
    /// preparation has succeeded. On any single failure nothing in the
    /// live table changes and the stored config is left untouched.
    pub async fn apply(&self, new_config: Config) -> Result<(), ReloadError> {
        let mut current = self.current.lock().await;

        let removed: HashSet<&str> = current
            .names()
            .filter(|name| !new_config.servers.contains_key(*name))
            .collect();
        let added: HashSet<&str> = new_config
            .names()
            .filter(|name| !current.servers.contains_key(*name))
            .collect();
        let changed: HashSet<&str> = current
            .names()
            .filter(|name| {
                new_config
                    .servers
                    .get(*name)
                    .is_some_and(|spec| spec != &current.servers[*name])
            })
            .collect();

        // Prepare phase: spawn every new/changed child without touching
        // the live table. Abort on the first failure.
        let mut prepared = Vec::new();
        for name in added.iter().chain(changed.iter()) {
            let spec = &new_config.servers[*name];
            match ChildSession::start(name, spec, self.handshake_timeout).await {
                Ok(child) => prepared.push((name.to_string(), child)),
                Err(source) => {
                    for (_, mut child) in prepared {
                        child.close().await;
                    }
                    return Err(ReloadError::MountFailed {
                        name: name.to_string(),
                        source,
                    });
                }
            }
        }

        // Commit phase: cannot fail from here.
        for name in removed.iter().chain(changed.iter()) {
            let path = mount_path(&self.path_prefix, name);
            if let Some(route) = self.table.unmount(&path).await {
                route.close().await;
            }
        }
        for (name, child) in prepared {
            let route = Arc::new(Route::new(
                mount_path(&self.path_prefix, &name),
                name.clone(),
                child,
                self.auth.clone(),
            ));
            // Unreachable in practice: `name` was just unmounted above if
            // it previously existed, and `added` names are new by
            // definition.
            let _ = self.table.mount(route).await;
        }

        *current = new_config;
        Ok(())
    }
}
