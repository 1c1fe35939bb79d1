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

use std::error::Error;
use std::fs;
use std::future::IntoFuture;
use std::sync::Arc;

use clap::Parser;
use nix::unistd::geteuid;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{filter::EnvFilter, filter::LevelFilter, fmt, prelude::*};

use faasd::cfg;
use faasd::daemon::Daemon;
use faasd::netlink::{BinderPtr, NetlinkBinder};
use faasd::registry::Registry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Log level is set from, in order of preference:
    // 1. RUST_LOG environment variable
    // 2. Level::Info
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
        .add_directive("hyper=warn".parse()?)
        .add_directive("netlink_proto=warn".parse()?);

    tracing_subscriber::registry()
        .with(fmt::Layer::default().compact().with_writer(std::io::stderr))
        .with(env_filter)
        .try_init()?;

    let options = cfg::FaasdOptions::parse();
    let cxt = cfg::Context::from(&options);
    tracing::debug!("The work directory is <{}>.", cxt.work_dir());

    // Address plumbing, runc, and descriptor passing into containers all
    // need superuser privileges.
    if !geteuid().is_root() {
        tracing::error!("faasd must run as root.");
        std::process::exit(1);
    }

    fs::create_dir_all(cxt.work_dir())?;
    let registry = Registry::load(&cxt)?;
    let binder: BinderPtr = Arc::new(NetlinkBinder::new(&cxt));
    let daemon = Arc::new(Daemon::new(cxt.clone(), registry, binder)?);

    daemon.sweep_stale();
    daemon.restore().await;

    let api = faasd::api::router(daemon.clone());
    let api_addr = format!("0.0.0.0:{}", cxt.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr).await?;
    tracing::info!("Control API listening on <{api_addr}>.");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        result = axum::serve(api_listener, api).into_future() => {
            result?;
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM.");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT.");
        }
    }

    daemon.shutdown().await;

    Ok(())
}
