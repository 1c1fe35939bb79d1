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
use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::apis::{Deployment, FaasError, FaasResult};
use crate::daemon::Daemon;

/// Image uploads name themselves in a header, so the body stays an opaque
/// byte stream and needs no multipart parsing.
pub const IMAGE_NAME_HEADER: &str = "x-image-name";

#[derive(Clone)]
pub struct AppState {
    pub daemon: Arc<Daemon>,
}

#[derive(Serialize, Debug)]
pub struct PublishResponse {
    pub name: String,
    pub ip: Ipv4Addr,
    pub cmd: Vec<String>,
}

#[derive(Serialize, Debug)]
pub struct IpResponse {
    pub name: String,
    pub ip: Ipv4Addr,
}

pub fn router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/api/new", post(handle_new))
        .route("/api/ip/{name}", get(handle_ip))
        .route("/api/list", get(handle_list))
        // The body is a whole image archive; axum's default cap is far too
        // small for it.
        .layer(DefaultBodyLimit::disable())
        .with_state(AppState { daemon })
}

async fn handle_new(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> FaasResult<Json<PublishResponse>> {
    let name = headers
        .get(IMAGE_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| FaasError::InvalidInput("missing X-Image-Name header".to_string()))?
        .to_string();

    tracing::info!("Publishing <{name}>, {} bytes of archive.", body.len());
    let deployment = state.daemon.publish(&name, &body).await?;

    Ok(Json(PublishResponse {
        name: deployment.name,
        ip: deployment.ip,
        cmd: deployment.cmd,
    }))
}

async fn handle_ip(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> FaasResult<Json<IpResponse>> {
    let deployment = state.daemon.lookup(&name).await?;

    Ok(Json(IpResponse {
        name: deployment.name,
        ip: deployment.ip,
    }))
}

async fn handle_list(State(state): State<AppState>) -> Json<BTreeMap<String, Deployment>> {
    Json(state.daemon.list().await)
}
