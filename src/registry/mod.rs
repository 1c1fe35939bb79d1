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

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::apis::{Deployment, FaasError, FaasResult};
use crate::cfg::Context;

const REGISTRY_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug)]
struct RegistryDoc {
    version: u32,
    deployments: BTreeMap<String, Deployment>,
}

/// The deployment table. Writers are serialized by the lock; the on-disk
/// document is replaced whole via write-to-temporary-then-rename, so readers
/// of the file never observe a partial document.
pub struct Registry {
    path: String,
    pool_start: Ipv4Addr,
    pool_end: Ipv4Addr,
    port: u16,
    inner: RwLock<BTreeMap<String, Deployment>>,
}

impl Registry {
    /// Load the persisted registry, if any. Records whose rootfs is missing
    /// are reported loudly but kept in the table; they are skipped at
    /// restore time rather than silently deleted.
    pub fn load(cxt: &Context) -> FaasResult<Self> {
        let path = cxt.registry_file();

        let deployments = match fs::read_to_string(&path) {
            Ok(data) => {
                let doc: RegistryDoc = serde_json::from_str(&data)
                    .map_err(|e| FaasError::Internal(format!("registry {path}: {e}")))?;
                if doc.version != REGISTRY_VERSION {
                    return Err(FaasError::Internal(format!(
                        "registry {path}: unsupported version {}",
                        doc.version
                    )));
                }
                doc.deployments
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(FaasError::Internal(format!("registry {path}: {e}"))),
        };

        for d in deployments.values() {
            if !fs::exists(&d.rootfs)? {
                tracing::error!(
                    "Rejecting deployment <{}>: rootfs <{}> is missing.",
                    d.name,
                    d.rootfs
                );
            }
        }

        Ok(Registry {
            path,
            pool_start: cxt.pool_start,
            pool_end: cxt.pool_end,
            port: cxt.listen_port,
            inner: RwLock::new(deployments),
        })
    }

    pub async fn lookup(&self, name: &str) -> FaasResult<Deployment> {
        let map = self.inner.read().await;
        map.get(name)
            .cloned()
            .ok_or_else(|| FaasError::NotFound(format!("no deployment named {name}")))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.read().await.contains_key(name)
    }

    pub async fn list(&self) -> BTreeMap<String, Deployment> {
        self.inner.read().await.clone()
    }

    /// Allocate an address, insert the record, and persist. The record is
    /// durable before this returns; on a persistence failure the insertion
    /// is reverted.
    pub async fn publish(
        &self,
        name: &str,
        rootfs: &str,
        cmd: Vec<String>,
    ) -> FaasResult<Deployment> {
        let mut map = self.inner.write().await;

        if map.contains_key(name) {
            return Err(FaasError::AlreadyExists(format!(
                "deployment {name} already exists"
            )));
        }

        let ip = self.allocate(&map)?;
        let deployment = Deployment {
            name: name.to_string(),
            ip,
            port: self.port,
            rootfs: rootfs.to_string(),
            cmd,
        };

        map.insert(name.to_string(), deployment.clone());
        if let Err(e) = self.save(&map) {
            map.remove(name);
            return Err(e);
        }

        Ok(deployment)
    }

    /// Remove a record and persist; used when a publish is rolled back.
    pub async fn remove(&self, name: &str) -> FaasResult<()> {
        let mut map = self.inner.write().await;
        let old = map.remove(name);
        if let Err(e) = self.save(&map) {
            if let Some(d) = old {
                map.insert(name.to_string(), d);
            }
            return Err(e);
        }

        Ok(())
    }

    /// First free address in pool order.
    fn allocate(&self, map: &BTreeMap<String, Deployment>) -> FaasResult<Ipv4Addr> {
        let used: HashSet<Ipv4Addr> = map.values().map(|d| d.ip).collect();

        for n in u32::from(self.pool_start)..=u32::from(self.pool_end) {
            let ip = Ipv4Addr::from(n);
            if !used.contains(&ip) {
                return Ok(ip);
            }
        }

        Err(FaasError::PoolExhausted(format!(
            "no free address in {}..={}",
            self.pool_start, self.pool_end
        )))
    }

    fn save(&self, map: &BTreeMap<String, Deployment>) -> FaasResult<()> {
        let doc = RegistryDoc {
            version: REGISTRY_VERSION,
            deployments: map.clone(),
        };
        let data = serde_json::to_string_pretty(&doc)?;

        let tmp = format!("{}.tmp", self.path);
        fs::write(&tmp, data)
            .map_err(|e| FaasError::Internal(format!("registry {tmp}: {e}")))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| FaasError::Internal(format!("registry {}: {e}", self.path)))?;

        Ok(())
    }
}
