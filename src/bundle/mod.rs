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

use oci_spec::runtime::{
    LinuxBuilder, LinuxCpuBuilder, LinuxMemoryBuilder, LinuxNamespaceBuilder, LinuxNamespaceType,
    LinuxResourcesBuilder, Mount, MountBuilder, ProcessBuilder, RootBuilder, SpecBuilder,
    UserBuilder,
};

use crate::apis::{Deployment, FaasError, FaasResult};
use crate::cfg::Context;

/// In-container path of the rendezvous socket.
pub const CONTROL_SOCKET: &str = "/control.sock";

const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Write a fresh OCI bundle for one request and return its directory. The
/// bundle only references the shared rootfs; deleting the directory leaves
/// no residue.
pub fn build(
    cxt: &Context,
    deployment: &Deployment,
    id: &str,
    socket_path: &str,
) -> FaasResult<String> {
    let bundle_dir = cxt.bundle_dir(id);
    fs::create_dir_all(&bundle_dir)
        .map_err(|e| FaasError::Internal(format!("bundle {bundle_dir}: {e}")))?;

    let process = ProcessBuilder::default()
        .terminal(false)
        .user(UserBuilder::default().uid(0u32).gid(0u32).build()?)
        .args(deployment.cmd.clone())
        .env(vec![DEFAULT_PATH.to_string()])
        .cwd("/")
        .no_new_privileges(true)
        .build()?;

    let root = RootBuilder::default()
        .path(deployment.rootfs.clone())
        .readonly(true)
        .build()?;

    let namespaces = [
        LinuxNamespaceType::Pid,
        LinuxNamespaceType::Network,
        LinuxNamespaceType::Ipc,
        LinuxNamespaceType::Uts,
        LinuxNamespaceType::Mount,
        LinuxNamespaceType::Cgroup,
    ]
    .into_iter()
    .map(|typ| LinuxNamespaceBuilder::default().typ(typ).build())
    .collect::<Result<Vec<_>, _>>()?;

    let resources = LinuxResourcesBuilder::default()
        .memory(
            LinuxMemoryBuilder::default()
                .limit(cxt.memory_limit)
                .build()?,
        )
        .cpu(
            LinuxCpuBuilder::default()
                .quota(cxt.cpu_quota)
                .period(100_000u64)
                .build()?,
        )
        .build()?;

    let linux = LinuxBuilder::default()
        .namespaces(namespaces)
        .resources(resources)
        .masked_paths(
            ["/proc/kcore", "/proc/latency_stats", "/sys/firmware"]
                .map(String::from)
                .to_vec(),
        )
        .readonly_paths(
            [
                "/proc/bus",
                "/proc/fs",
                "/proc/irq",
                "/proc/sys",
                "/proc/sysrq-trigger",
            ]
            .map(String::from)
            .to_vec(),
        )
        .build()?;

    let spec = SpecBuilder::default()
        .version("1.0.0")
        .process(process)
        .root(root)
        .mounts(mounts(socket_path)?)
        .linux(linux)
        .build()?;

    spec.save(format!("{bundle_dir}/config.json"))?;

    Ok(bundle_dir)
}

/// Remove a bundle directory; a missing directory is not an error.
pub fn remove(bundle_dir: &str) -> FaasResult<()> {
    match fs::remove_dir_all(bundle_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FaasError::Internal(format!("bundle {bundle_dir}: {e}"))),
    }
}

fn mounts(socket_path: &str) -> FaasResult<Vec<Mount>> {
    let mut mounts = vec![MountBuilder::default()
        .destination(CONTROL_SOCKET)
        .typ("bind")
        .source(socket_path)
        .options(vec!["bind".to_string(), "ro".to_string()])
        .build()?];

    // The conventional pseudo-filesystems, plus a writable /tmp; the rootfs
    // itself stays read-only.
    let fixed: [(&str, &str, &str, &[&str]); 8] = [
        ("/proc", "proc", "proc", &[]),
        (
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        ),
        (
            "/dev/pts",
            "devpts",
            "devpts",
            &[
                "nosuid",
                "noexec",
                "newinstance",
                "ptmxmode=0666",
                "mode=0620",
                "gid=5",
            ],
        ),
        (
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        ),
        (
            "/dev/mqueue",
            "mqueue",
            "mqueue",
            &["nosuid", "noexec", "nodev"],
        ),
        ("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
        (
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "relatime", "ro"],
        ),
        ("/tmp", "tmpfs", "tmpfs", &["nosuid", "nodev", "mode=1777"]),
    ];

    for (destination, typ, source, options) in fixed {
        let mut builder = MountBuilder::default()
            .destination(destination)
            .typ(typ)
            .source(source);
        if !options.is_empty() {
            builder = builder.options(options.iter().map(|o| o.to_string()).collect::<Vec<_>>());
        }
        mounts.push(builder.build()?);
    }

    Ok(mounts)
}
