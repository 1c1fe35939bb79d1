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

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::apis::{Deployment, FaasError, FaasResult};
use crate::cfg::Context;
use crate::supervisor;

const BACKLOG: u32 = 1024;

/// Counts in-flight request handlers so shutdown can drain them. Accept
/// loops are simply aborted; handlers run to completion or to the drain
/// deadline.
#[derive(Default)]
struct RequestGate {
    active: AtomicUsize,
    idle: Notify,
}

struct RequestPermit(Arc<RequestGate>);

impl RequestGate {
    fn enter(self: &Arc<Self>) -> RequestPermit {
        self.active.fetch_add(1, Ordering::AcqRel);
        RequestPermit(self.clone())
    }

    async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for RequestPermit {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// One accepting task per deployment. Accepts never block on request
/// handling; every connection is dispatched to the supervisor on its own
/// task.
pub struct ListenerManager {
    cxt: Context,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    gate: Arc<RequestGate>,
}

impl ListenerManager {
    pub fn new(cxt: Context) -> Self {
        ListenerManager {
            cxt,
            tasks: Mutex::new(HashMap::new()),
            gate: Arc::new(RequestGate::default()),
        }
    }

    /// Bind the deployment's address and start accepting. By the time this
    /// returns, connections are being served.
    pub async fn add_listener(&self, deployment: &Deployment) -> FaasResult<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&deployment.name) {
            return Err(FaasError::Bind(format!(
                "listener for {} already exists",
                deployment.name
            )));
        }

        let addr = SocketAddr::from((deployment.ip, deployment.port));
        let listener = bind(addr)
            .map_err(|e| FaasError::Bind(format!("bind {addr} for {}: {e}", deployment.name)))?;
        tracing::info!("Listening on <{addr}> for <{}>.", deployment.name);

        let task = tokio::spawn(accept_loop(
            listener,
            self.cxt.clone(),
            deployment.clone(),
            self.gate.clone(),
        ));
        tasks.insert(deployment.name.clone(), task);

        Ok(())
    }

    /// Stop accepting for a deployment and close its socket. In-flight
    /// requests are unaffected.
    pub async fn remove_listener(&self, name: &str) -> FaasResult<()> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .remove(name)
            .ok_or_else(|| FaasError::NotFound(format!("no listener for {name}")))?;
        task.abort();
        // The socket closes when the aborted task is dropped; wait for that
        // so the address is immediately bindable again.
        let _ = task.await;
        tracing::info!("Closed listener of <{name}>.");

        Ok(())
    }

    /// Close every listener, then wait up to `drain` for in-flight request
    /// handlers to finish.
    pub async fn shutdown(&self, drain: Duration) {
        let mut tasks = self.tasks.lock().await;
        for (name, task) in tasks.drain() {
            task.abort();
            let _ = task.await;
            tracing::debug!("Closed listener of <{name}>.");
        }
        drop(tasks);

        if tokio::time::timeout(drain, self.gate.drain()).await.is_err() {
            tracing::warn!(
                "In-flight requests still running after {drain:?}; abandoning them."
            );
        }
    }
}

fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(BACKLOG)
}

async fn accept_loop(
    listener: TcpListener,
    cxt: Context,
    deployment: Deployment,
    gate: Arc<RequestGate>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!("Request from <{peer}> for <{}>.", deployment.name);
                let permit = gate.enter();
                let cxt = cxt.clone();
                let deployment = deployment.clone();
                tokio::spawn(async move {
                    supervisor::handle(cxt, deployment, stream).await;
                    drop(permit);
                });
            }
            Err(e) if transient(&e) => {
                tracing::warn!("Transient accept error for <{}>: {e}", deployment.name);
            }
            Err(e) => {
                tracing::error!(
                    "Listener of <{}> degraded, no longer accepting: {e}",
                    deployment.name
                );
                break;
            }
        }
    }
}

fn transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
    )
}
