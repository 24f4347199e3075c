pub mod api;
pub mod events;
pub mod models;

/// Failure to parse a wire-level token (resource name, order, operator).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown resource: {0}")]
    Resource(String),
    #[error("unknown sort direction: {0}")]
    Direction(String),
    #[error("unsupported filter operator: {0}")]
    Operator(String),
    #[error("unknown message type: {0}")]
    MessageKind(String),
}
