//! Leader-aware connection to the resource-management role.
//!
//! Election happens elsewhere; this module consumes "who leads now"
//! notifications ([`LeaderRetrievalService`]) and keeps exactly one session
//! open to the newest leader ([`LeaderConnector`]). The RPC layer is reached
//! only through [`LeaderGateway`] and [`LeaderSession`].

mod connector;
mod retrieval;

pub use connector::{
    ConnectionState, ConnectorConfig, ConnectorContext, ConnectorStatus, LeaderConnector,
};
pub use retrieval::SettableLeaderRetrieval;

use crate::resource_id::ResourceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Monotonic leadership fencing value; larger is newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FencingToken(pub u64);

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaderAddress {
    pub endpoint: String,
    pub token: FencingToken,
}

impl LeaderAddress {
    pub fn new(endpoint: impl Into<String>, token: u64) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: FencingToken(token),
        }
    }

    /// Whether this notification may replace `current`.
    pub fn supersedes(&self, current: Option<&LeaderAddress>) -> bool {
        current.map_or(true, |current| self.token > current.token)
    }
}

impl fmt::Display for LeaderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.endpoint, self.token)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LeaderRetrievalError {
    #[error("leader retrieval already started")]
    AlreadyStarted,
    #[error("leader retrieval failed: {0}")]
    Failed(String),
}

pub trait LeaderRetrievalListener: Send + Sync {
    fn notify_leader_address(&self, leader: LeaderAddress);
    fn handle_error(&self, error: LeaderRetrievalError);
}

/// Source of leader notifications. Delivery may be out of order and from
/// any thread.
pub trait LeaderRetrievalService: Send + Sync {
    fn start(&self, listener: Arc<dyn LeaderRetrievalListener>)
        -> Result<(), LeaderRetrievalError>;
    fn stop(&self);
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("leader {endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },
    #[error("leader {endpoint} rejected registration: {reason}")]
    Rejected { endpoint: String, reason: String },
    #[error("heartbeat to {endpoint} failed: {reason}")]
    Heartbeat { endpoint: String, reason: String },
}

/// An established logical session with one leader.
pub trait LeaderSession: Send + Sync {
    fn leader(&self) -> &LeaderAddress;
    fn heartbeat(&self) -> Result<(), ConnectionError>;
    fn close(&self);
}

pub trait LeaderGateway: Send + Sync {
    /// Blocking connect; the connector always calls it off the
    /// notification thread.
    fn connect(
        &self,
        leader: &LeaderAddress,
        worker: &ResourceId,
    ) -> Result<Arc<dyn LeaderSession>, ConnectionError>;
}
