//! Pooled connection variants and the factory seam
//!
//! The pool owns connection lifecycle but knows nothing about how a
//! connection is built; the engine hands it a [`ConnectionFactory`]. All
//! three variants are cheaply cloneable handles: SSH multiplexes channels
//! over one transport, Docker and Kubernetes clients are multi-tenant.

use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::docker::DockerConnection;
use crate::adapters::ssh::SshSession;
use crate::core::Target;
use crate::error::ExecError;

/// A live transport cached by the pool.
#[derive(Clone)]
pub enum PooledConnection {
    Ssh(Arc<SshSession>),
    Docker(DockerConnection),
    Kubernetes(kube::Client),
}

impl PooledConnection {
    pub fn kind_name(&self) -> &'static str {
        match self {
            PooledConnection::Ssh(_) => "ssh",
            PooledConnection::Docker(_) => "docker",
            PooledConnection::Kubernetes(_) => "kubernetes",
        }
    }

    /// Cheap type-specific liveness probe used on borrow.
    pub async fn health_check(&self) -> bool {
        match self {
            PooledConnection::Ssh(session) => session.is_healthy().await,
            PooledConnection::Docker(conn) => conn.ping().await,
            PooledConnection::Kubernetes(client) => client.apiserver_version().await.is_ok(),
        }
    }

    /// Close the underlying transport. Dropping the last clone has the same
    /// effect; this exists so eviction can disconnect eagerly.
    pub async fn close(self) {
        if let PooledConnection::Ssh(session) = self {
            session.close().await;
        }
        // Docker and Kubernetes clients close with their last clone.
    }

    pub fn as_ssh(&self) -> Option<&Arc<SshSession>> {
        match self {
            PooledConnection::Ssh(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_docker(&self) -> Option<&DockerConnection> {
        match self {
            PooledConnection::Docker(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_kubernetes(&self) -> Option<&kube::Client> {
        match self {
            PooledConnection::Kubernetes(c) => Some(c),
            _ => None,
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PooledConnection::{}", self.kind_name())
    }
}

/// Builds connections for the pool. The engine supplies the implementation;
/// the pool never reaches back into the engine.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, target: &Target) -> Result<PooledConnection, ExecError>;
}
