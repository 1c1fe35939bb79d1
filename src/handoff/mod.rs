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

use std::fs;
use std::io::IoSlice;
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use tokio::net::UnixListener;

use crate::apis::{FaasError, FaasResult};

/// The handoff message carries exactly one byte alongside the descriptor, so
/// the container can do a single recvmsg and take the first ancillary record.
const PAYLOAD: &[u8] = b"!";

/// A per-request Unix-domain rendezvous socket. The container connects to it
/// from inside the bundle; `transfer` then hands over the accepted client
/// descriptor as SCM_RIGHTS ancillary data.
///
/// The filesystem path is unlinked when the value drops, whether or not the
/// transfer happened.
pub struct Rendezvous {
    path: String,
    listener: UnixListener,
}

impl Rendezvous {
    /// Bind a fresh listening socket at `path`, accepting exactly one
    /// connection. A stale socket file from a crashed run is replaced.
    pub fn prepare(path: &str) -> FaasResult<Self> {
        let _ = fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .map_err(|e| FaasError::Handoff(format!("bind {path}: {e}")))?;

        Ok(Rendezvous {
            path: path.to_string(),
            listener,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the container to connect, then send the one-byte payload
    /// with `fd` attached. The descriptor is consumed: the kernel object
    /// lives on in the container, and our reference is closed once the send
    /// has returned.
    pub async fn transfer(self, fd: OwnedFd, deadline: Duration) -> FaasResult<()> {
        let (stream, _) = tokio::time::timeout(deadline, self.listener.accept())
            .await
            .map_err(|_| {
                FaasError::Timeout(format!(
                    "no connection on {} within {deadline:?}",
                    self.path
                ))
            })?
            .map_err(|e| FaasError::Handoff(format!("accept on {}: {e}", self.path)))?;

        // One tiny blocking sendmsg; tokio's stream is nonblocking, so drop
        // to a std stream first.
        let stream = stream
            .into_std()
            .map_err(|e| FaasError::Handoff(e.to_string()))?;
        stream
            .set_nonblocking(false)
            .map_err(|e| FaasError::Handoff(e.to_string()))?;

        let iov = [IoSlice::new(PAYLOAD)];
        let fds = [fd.as_raw_fd()];
        let cmsg = [ControlMessage::ScmRights(&fds)];

        sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
            .map_err(|e| FaasError::Handoff(format!("send descriptor: {e}")))?;

        Ok(())
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove rendezvous socket <{}>: {e}", self.path);
            }
        }
    }
}
