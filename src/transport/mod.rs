//! Network binding of the client channel.
//!
//! The coordinator core only talks to [`ClientChannel`](crate::client::ClientChannel)
//! values. This module provides one concrete binding: JSON over HTTP, where
//! clients register with the coordinator and the coordinator calls back into
//! each client's `/fit` and `/evaluate` endpoints.

pub mod http;

pub use http::{router, HttpClientChannel, RegistryState};

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::error::RoundNumber;
use crate::params::{ClientId, ParameterVector};
use crate::scheduler::RoundProgress;

/// Body of `POST /register`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Id the client wants to be known by
    pub client_id: ClientId,
    /// Base URL the coordinator calls back on
    pub url: String,
}

/// Reply to `POST /register`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Whether the client is now registered
    pub ok: bool,
    /// Human-readable outcome
    pub message: String,
}

/// Body the coordinator posts to a client's `/fit` and `/evaluate`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundRequest<'a> {
    /// Round the parameters belong to
    pub round: RoundNumber,
    /// Global parameters
    pub parameters: Cow<'a, ParameterVector>,
}

/// Reply to `GET /status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Latest scheduler progress
    pub progress: RoundProgress,
    /// Ids of the registered clients
    pub registered_clients: Vec<ClientId>,
}
