//! Error types shared by the reconcilers and their adapters.

use ipnetwork::IpNetworkError;
use thiserror::Error;

/// Errors raised while reading or converging node networking state.
///
/// Collaborator failures (`MembershipUnavailable`, `Mesh`, `Kernel`,
/// `Firewall`) are transient: the current pass is abandoned and retried on
/// the next tick. `InvalidSubnet` and `MissingSubnet` are structural and only
/// ever skip the item they refer to.
#[derive(Debug, Error)]
pub enum Error {
    #[error("membership source unavailable: {0}")]
    MembershipUnavailable(String),

    #[error("mesh control API error: {0}")]
    Mesh(String),

    #[error("kernel networking error: {0}")]
    Kernel(String),

    #[error("packet filter error: {0}")]
    Firewall(String),

    #[error("node {node} has invalid subnet {subnet:?}: {source}")]
    InvalidSubnet {
        node: String,
        subnet: String,
        source: IpNetworkError,
    },

    #[error("node {0} has no subnet allocated")]
    MissingSubnet(String),

    #[error("interface {0} has no IPv4 address")]
    NoLinkAddress(String),

    #[error("invalid CNI config {path}: {reason}")]
    CniConfig { path: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::MembershipUnavailable(e.to_string())
    }
}
