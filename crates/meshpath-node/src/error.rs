//! Daemon error types.

use meshpath_prefix::store::StoreError;
use meshpath_routing::error::RoutingError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
