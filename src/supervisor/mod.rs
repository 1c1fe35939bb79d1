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

use std::os::fd::OwnedFd;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::apis::{Deployment, FaasError, FaasResult};
use crate::bundle;
use crate::cfg::Context;
use crate::handoff::Rendezvous;
use crate::runtime;

/// How long a freshly killed container gets to be reaped.
const REAP_DEADLINE: Duration = Duration::from_secs(2);

/// Run the full lifecycle of one request: fresh container, rendezvous,
/// descriptor handoff, bounded wait, teardown. Every path out of here
/// deletes the runtime record and the bundle; the shared rootfs is never
/// touched.
pub async fn handle(cxt: Context, deployment: Deployment, client: TcpStream) {
    let id = format!("faas-{}", Uuid::new_v4());
    tracing::debug!(
        "Dispatching request for <{}> to container <{id}>.",
        deployment.name
    );

    match invoke(&cxt, &deployment, &id, client).await {
        Ok(status) => {
            tracing::debug!("Container <{id}> exited with <{status}>.");
        }
        Err(e) => {
            tracing::error!("Request to <{}> failed in <{id}>: {e}", deployment.name);
        }
    }

    runtime::delete(&cxt, &id).await;
    if let Err(e) = bundle::remove(&cxt.bundle_dir(&id)) {
        tracing::warn!("Failed to remove bundle of <{id}>: {e}");
    }
}

async fn invoke(
    cxt: &Context,
    deployment: &Deployment,
    id: &str,
    client: TcpStream,
) -> FaasResult<ExitStatus> {
    let socket_path = cxt.rendezvous_path(id);
    let rendezvous = Rendezvous::prepare(&socket_path)?;

    bundle::build(cxt, deployment, id, &socket_path)?;

    let mut child = runtime::launch(cxt, &cxt.bundle_dir(id), id)?;
    let stderr = runtime::capture_stderr(&mut child);
    tracing::debug!("Launched container <{id}> for <{}>.", deployment.name);

    // The client socket leaves tokio here; the container expects a plain
    // blocking descriptor.
    let client = client
        .into_std()
        .map_err(|e| FaasError::Internal(e.to_string()))?;
    client
        .set_nonblocking(false)
        .map_err(|e| FaasError::Internal(e.to_string()))?;
    let client: OwnedFd = client.into();

    if let Err(e) = rendezvous.transfer(client, cxt.rendezvous_deadline()).await {
        reap(cxt, id, &mut child, stderr).await;
        return Err(e);
    }
    tracing::debug!("Transferred client descriptor to <{id}>.");

    match runtime::wait(&mut child, cxt.run_deadline()).await? {
        Some(status) => {
            if !status.success() {
                report_stderr(id, stderr).await;
            }
            Ok(status)
        }
        None => {
            reap(cxt, id, &mut child, stderr).await;
            Err(FaasError::Timeout(format!(
                "container {id} still running after {:?}",
                cxt.run_deadline()
            )))
        }
    }
}

/// Force-kill a misbehaving container, give it a moment to be reaped, and
/// surface whatever it wrote to stderr.
async fn reap(cxt: &Context, id: &str, child: &mut Child, stderr: Option<JoinHandle<String>>) {
    runtime::kill(cxt, id).await;
    let _ = runtime::wait(child, REAP_DEADLINE).await;
    report_stderr(id, stderr).await;
}

async fn report_stderr(id: &str, stderr: Option<JoinHandle<String>>) {
    let Some(handle) = stderr else {
        return;
    };

    match tokio::time::timeout(Duration::from_secs(1), handle).await {
        Ok(Ok(output)) if !output.trim().is_empty() => {
            tracing::error!("Container <{id}> stderr: {}", output.trim());
        }
        Ok(_) => {}
        Err(_) => tracing::debug!("Container <{id}> stderr still open; not waiting."),
    }
}
