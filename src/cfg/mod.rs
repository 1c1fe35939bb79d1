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

use std::net::Ipv4Addr;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct FaasdOptions {
    /// The work directory of faasd.
    #[arg(short, long, default_value = "/var/lib/faasd")]
    pub work_dir: String,

    /// TCP port of the control API.
    #[arg(long, default_value_t = 8080)]
    pub api_port: u16,

    /// TCP port each deployment listens on.
    #[arg(long, default_value_t = 80)]
    pub listen_port: u16,

    /// First address of the allocation pool.
    #[arg(long, default_value = "10.0.0.10")]
    pub pool_start: Ipv4Addr,

    /// Last address of the allocation pool.
    #[arg(long, default_value = "10.0.0.254")]
    pub pool_end: Ipv4Addr,

    /// Prefix length used when plumbing deployment addresses.
    #[arg(long, default_value_t = 24)]
    pub prefix_len: u8,

    /// Host interface that carries the deployment addresses.
    #[arg(long, default_value = "lo")]
    pub interface: String,

    /// Address label marking faasd-owned addresses; must be prefixed
    /// with the interface name.
    #[arg(long, default_value = "lo:faas")]
    pub label: String,

    /// The OCI runtime binary.
    #[arg(long, default_value = "runc")]
    pub runc: String,

    /// Seconds a container gets to connect to its rendezvous socket.
    #[arg(long, default_value_t = 5)]
    pub rendezvous_timeout: u64,

    /// Seconds a container gets to exit after the handoff.
    #[arg(long, default_value_t = 30)]
    pub run_timeout: u64,

    /// Seconds to wait for in-flight requests on shutdown.
    #[arg(long, default_value_t = 10)]
    pub drain_timeout: u64,

    /// Container memory limit in bytes.
    #[arg(long, default_value_t = 512 * 1024 * 1024)]
    pub memory_limit: i64,

    /// Container CPU quota in microseconds per 100ms period.
    #[arg(long, default_value_t = 100_000)]
    pub cpu_quota: i64,
}

#[derive(Clone, PartialEq, Debug)]
pub struct Context {
    pub work_dir: String,
    pub api_port: u16,
    pub listen_port: u16,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    pub prefix_len: u8,
    pub interface: String,
    pub label: String,
    pub runc: String,
    pub rendezvous_timeout: u64,
    pub run_timeout: u64,
    pub drain_timeout: u64,
    pub memory_limit: i64,
    pub cpu_quota: i64,
}

impl From<&FaasdOptions> for Context {
    fn from(o: &FaasdOptions) -> Self {
        Self {
            work_dir: o.work_dir.clone(),
            api_port: o.api_port,
            listen_port: o.listen_port,
            pool_start: o.pool_start,
            pool_end: o.pool_end,
            prefix_len: o.prefix_len,
            interface: o.interface.clone(),
            label: o.label.clone(),
            runc: o.runc.clone(),
            rendezvous_timeout: o.rendezvous_timeout,
            run_timeout: o.run_timeout,
            drain_timeout: o.drain_timeout,
            memory_limit: o.memory_limit,
            cpu_quota: o.cpu_quota,
        }
    }
}

impl Context {
    pub fn work_dir(&self) -> String {
        self.work_dir.clone()
    }

    pub fn images_dir(&self) -> String {
        format!("{}/images", self.work_dir)
    }

    pub fn bundles_dir(&self) -> String {
        format!("{}/bundles", self.work_dir)
    }

    pub fn image_dir(&self, name: &str) -> String {
        format!("{}/images/{}", self.work_dir, name)
    }

    pub fn image_rootfs(&self, name: &str) -> String {
        format!("{}/images/{}/rootfs", self.work_dir, name)
    }

    pub fn bundle_dir(&self, id: &str) -> String {
        format!("{}/bundles/{}", self.work_dir, id)
    }

    /// The rendezvous socket lives next to its bundle so the stale-state
    /// sweep clears both in one pass.
    pub fn rendezvous_path(&self, id: &str) -> String {
        format!("{}/bundles/{}.sock", self.work_dir, id)
    }

    pub fn registry_file(&self) -> String {
        format!("{}/registry.json", self.work_dir)
    }

    pub fn rendezvous_deadline(&self) -> Duration {
        Duration::from_secs(self.rendezvous_timeout)
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_timeout)
    }

    pub fn drain_deadline(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }
}
