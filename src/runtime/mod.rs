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

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::apis::{FaasError, FaasResult};
use crate::cfg::Context;

/// Launch `runc run` on a bundle without blocking on its exit. Stdio is
/// piped so diagnostics can be surfaced when the container fails.
pub fn launch(cxt: &Context, bundle_dir: &str, id: &str) -> FaasResult<Child> {
    Command::new(&cxt.runc)
        .arg("run")
        .arg(id)
        .current_dir(bundle_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| FaasError::RuntimeLaunch(format!("spawn {} run {id}: {e}", cxt.runc)))
}

/// Drain the child's stderr in the background; the handle resolves once the
/// container closes its end.
pub fn capture_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
    let mut stderr = child.stderr.take()?;

    Some(tokio::spawn(async move {
        let mut buf = String::new();
        let _ = stderr.read_to_string(&mut buf).await;
        buf
    }))
}

/// Wait for the container to exit, bounded by `deadline`. `Ok(None)` means
/// the deadline passed with the container still running.
pub async fn wait(child: &mut Child, deadline: Duration) -> FaasResult<Option<ExitStatus>> {
    match tokio::time::timeout(deadline, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(e)) => Err(FaasError::Internal(format!("wait for container: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Forcefully signal a container. Failures are tolerated; the container may
/// already be gone.
pub async fn kill(cxt: &Context, id: &str) {
    match Command::new(&cxt.runc)
        .args(["kill", id, "KILL"])
        .output()
        .await
    {
        Ok(out) if !out.status.success() => {
            tracing::debug!(
                "<{} kill {id}> exited with <{}>: {}",
                cxt.runc,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(_) => {}
        Err(e) => tracing::debug!("Failed to run <{} kill {id}>: {e}", cxt.runc),
    }
}

/// Delete the container record from the runtime. Idempotent; always called
/// on the way out of a request, whatever happened before.
pub async fn delete(cxt: &Context, id: &str) {
    match Command::new(&cxt.runc)
        .args(["delete", "--force", id])
        .output()
        .await
    {
        Ok(out) if !out.status.success() => {
            tracing::debug!(
                "<{} delete --force {id}> exited with <{}>: {}",
                cxt.runc,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(_) => {}
        Err(e) => tracing::debug!("Failed to run <{} delete {id}>: {e}", cxt.runc),
    }
}
