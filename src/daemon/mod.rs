/*
Copyright 2024 The openBCE Authors.
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
    http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::collections::BTreeMap;
use std::fs;

use crate::apis::{Deployment, FaasError, FaasResult};
use crate::cfg::Context;
use crate::image;
use crate::listener::ListenerManager;
use crate::netlink::BinderPtr;
use crate::registry::Registry;

const MAX_NAME_LEN: usize = 64;

/// The control plane: owns the registry, the listener set, and the address
/// binder, and runs the publish/restore/shutdown flows.
pub struct Daemon {
    cxt: Context,
    registry: Registry,
    listeners: ListenerManager,
    binder: BinderPtr,
}

impl Daemon {
    pub fn new(cxt: Context, registry: Registry, binder: BinderPtr) -> FaasResult<Self> {
        fs::create_dir_all(cxt.images_dir())?;
        fs::create_dir_all(cxt.bundles_dir())?;

        Ok(Daemon {
            listeners: ListenerManager::new(cxt.clone()),
            cxt,
            registry,
            binder,
        })
    }

    pub fn context(&self) -> &Context {
        &self.cxt
    }

    /// Publish an image archive under `name`. Strictly ordered: the rootfs
    /// is materialized, the record persisted, the address plumbed, and the
    /// listener accepting before this returns. Any failure undoes every
    /// partial effect in reverse.
    pub async fn publish(&self, name: &str, archive: &[u8]) -> FaasResult<Deployment> {
        validate_name(name)?;

        if self.registry.contains(name).await {
            return Err(FaasError::AlreadyExists(format!(
                "deployment {name} already exists"
            )));
        }

        let image_dir = self.cxt.image_dir(name);
        let cmd = match image::materialize(archive, &image_dir) {
            Ok(cmd) => cmd,
            Err(e) => {
                // A rootfs we refused to overlay is not ours to delete.
                if !matches!(e, FaasError::AlreadyExists(_)) {
                    let _ = fs::remove_dir_all(&image_dir);
                }
                return Err(e);
            }
        };
        let rootfs = self.cxt.image_rootfs(name);
        tracing::info!("Materialized <{name}> at <{rootfs}>, command <{cmd:?}>.");

        let deployment = match self.registry.publish(name, &rootfs, cmd).await {
            Ok(d) => d,
            Err(e) => {
                let _ = fs::remove_dir_all(&image_dir);
                return Err(e);
            }
        };

        if let Err(e) = self.binder.add(deployment.ip).await {
            self.rollback(&deployment, false).await;
            return Err(e);
        }

        if let Err(e) = self.listeners.add_listener(&deployment).await {
            self.rollback(&deployment, true).await;
            return Err(e);
        }

        tracing::info!("Deployed <{name}> at <{}>.", deployment.ip);
        Ok(deployment)
    }

    pub async fn lookup(&self, name: &str) -> FaasResult<Deployment> {
        self.registry.lookup(name).await
    }

    pub async fn list(&self) -> BTreeMap<String, Deployment> {
        self.registry.list().await
    }

    /// Rebind every durable deployment: address first, then listener. A
    /// record that cannot be restored is reported and skipped; the rest of
    /// the table still comes up.
    pub async fn restore(&self) {
        for (name, deployment) in self.registry.list().await {
            if !fs::exists(&deployment.rootfs).unwrap_or(false) {
                tracing::error!(
                    "Not restoring <{name}>: rootfs <{}> is missing.",
                    deployment.rootfs
                );
                continue;
            }

            if let Err(e) = self.binder.add(deployment.ip).await {
                tracing::error!("Not restoring <{name}>: {e}");
                continue;
            }
            if let Err(e) = self.listeners.add_listener(&deployment).await {
                tracing::error!("Not restoring <{name}>: {e}");
                continue;
            }

            tracing::info!("Restored <{name}> at <{}>.", deployment.ip);
        }
    }

    /// Remove bundles and rendezvous sockets left behind by a previous
    /// crash. Runs before listeners come up, so nothing here is in use.
    pub fn sweep_stale(&self) {
        let bundles = self.cxt.bundles_dir();
        let entries = match fs::read_dir(&bundles) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Cannot sweep <{bundles}>: {e}");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => tracing::info!("Swept stale <{}>.", path.display()),
                Err(e) => tracing::warn!("Failed to sweep <{}>: {e}", path.display()),
            }
        }
    }

    /// Graceful shutdown: stop accepting, drain in-flight requests up to
    /// the deadline, remove only labeled addresses, sweep transient state.
    /// The registry and every rootfs stay on disk for the next start.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down; draining in-flight requests.");
        self.listeners.shutdown(self.cxt.drain_deadline()).await;

        if let Err(e) = self.binder.remove_labeled().await {
            tracing::warn!("Failed to remove labeled addresses: {e}");
        }

        self.sweep_stale();
        tracing::info!("Shutdown complete.");
    }

    /// Undo a half-finished publish.
    async fn rollback(&self, deployment: &Deployment, unbind: bool) {
        if unbind {
            if let Err(e) = self.binder.remove(deployment.ip).await {
                tracing::warn!("Rollback of <{}>: {e}", deployment.name);
            }
        }
        if let Err(e) = self.registry.remove(&deployment.name).await {
            tracing::warn!("Rollback of <{}>: {e}", deployment.name);
        }
        let _ = fs::remove_dir_all(self.cxt.image_dir(&deployment.name));
    }
}

/// Deployment names become path components and address labels; keep them
/// boring.
fn validate_name(name: &str) -> FaasResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(FaasError::InvalidInput(format!(
            "image name must be 1..={MAX_NAME_LEN} characters"
        )));
    }
    if name.starts_with('.') {
        return Err(FaasError::InvalidInput(
            "image name must not start with a dot".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(FaasError::InvalidInput(format!(
            "image name {name} contains invalid characters"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        for name in ["f", "hello", "img-2", "a_b.c", "UPPER9"] {
            assert!(validate_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_path_like_and_odd_names() {
        for name in ["", "a/b", "../up", ".", "..", ".hidden", "sp ace", "uni\u{e9}"] {
            assert!(
                matches!(validate_name(name), Err(FaasError::InvalidInput(_))),
                "{name}"
            );
        }
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(validate_name(&long).is_err());
    }
}
