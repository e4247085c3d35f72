//! Error types for minicoord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    // === Raft / Leadership Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("Raft error: {0}")]
    Raft(String),

    #[error("Consensus timeout")]
    ConsensusTimeout,

    // === Routing Errors ===
    #[error("Wrong node: owner is {0}")]
    WrongNode(String),

    #[error("No nodes in hash ring")]
    EmptyRing,

    // === Client Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Client {client_id} is already waiting on {resource}")]
    AlreadyWaiting { client_id: String, resource: String },

    // === Network Errors ===
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer unavailable: {0}")]
    Unavailable(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::ConsensusTimeout
                | Error::NotLeader(_)
                | Error::Unavailable(_)
        )
    }

    /// Convert to gRPC status for RPC responses
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::Code;
        match self {
            Error::NotFound(_) => tonic::Status::new(Code::NotFound, self.to_string()),
            Error::NotLeader(leader) => {
                let mut status = tonic::Status::new(Code::FailedPrecondition, self.to_string());
                if let Ok(value) = leader.parse() {
                    status.metadata_mut().insert("leader", value);
                }
                status
            }
            Error::WrongNode(owner) => {
                let mut status = tonic::Status::new(Code::FailedPrecondition, self.to_string());
                if let Ok(value) = owner.parse() {
                    status.metadata_mut().insert("owner", value);
                }
                status
            }
            Error::InvalidArgument(_) | Error::InvalidConfig(_) | Error::AlreadyWaiting { .. } => {
                tonic::Status::new(Code::InvalidArgument, self.to_string())
            }
            Error::ConsensusTimeout | Error::Timeout(_) => {
                tonic::Status::new(Code::DeadlineExceeded, self.to_string())
            }
            Error::Unavailable(_) | Error::ConnectionFailed(_) | Error::EmptyRing => {
                tonic::Status::new(Code::Unavailable, self.to_string())
            }
            Error::Grpc(status) => status.clone(),
            _ => tonic::Status::new(Code::Internal, self.to_string()),
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::NotLeader(_) | Error::WrongNode(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::InvalidArgument(_) | Error::InvalidConfig(_) | Error::AlreadyWaiting { .. } => {
                StatusCode::BAD_REQUEST
            }
            Error::Timeout(_) | Error::ConsensusTimeout => StatusCode::REQUEST_TIMEOUT,
            Error::Unavailable(_) | Error::ConnectionFailed(_) | Error::EmptyRing => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
