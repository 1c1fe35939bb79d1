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

use std::io;
use std::net::Ipv4Addr;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

pub type FaasResult<T> = Result<T, FaasError>;

/// A published function: one name, one address, one shared rootfs, one
/// launch command. Records are immutable once registered.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct Deployment {
    pub name: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub rootfs: String,
    pub cmd: Vec<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum FaasError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    PoolExhausted(String),
    #[error("{0}")]
    Extraction(String),
    #[error("{0}")]
    Bind(String),
    #[error("{0}")]
    RuntimeLaunch(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Handoff(String),
    #[error("{0}")]
    Internal(String),
}

impl From<io::Error> for FaasError {
    fn from(e: io::Error) -> Self {
        FaasError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for FaasError {
    fn from(e: serde_json::Error) -> Self {
        FaasError::Internal(e.to_string())
    }
}

impl From<nix::Error> for FaasError {
    fn from(e: nix::Error) -> Self {
        FaasError::Internal(e.to_string())
    }
}

impl From<oci_spec::OciSpecError> for FaasError {
    fn from(e: oci_spec::OciSpecError) -> Self {
        FaasError::Internal(e.to_string())
    }
}

impl From<rtnetlink::Error> for FaasError {
    fn from(e: rtnetlink::Error) -> Self {
        FaasError::Bind(e.to_string())
    }
}

impl IntoResponse for FaasError {
    fn into_response(self) -> Response {
        let status = match &self {
            FaasError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            FaasError::AlreadyExists(_) => StatusCode::CONFLICT,
            FaasError::NotFound(_) => StatusCode::NOT_FOUND,
            FaasError::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}
