use std::net::SocketAddr;

/// Errors returned by [`IceSession`](crate::IceSession) operations and stored on failed checks
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid component id {0}")]
    InvalidComponentId(u8),
    #[error("invalid candidate id")]
    InvalidCandidateId,
    #[error("too many {0}")]
    TooMany(&'static str),
    #[error("no host candidate for base address {0}")]
    NoHostCandidate(SocketAddr),
    #[error("no matching candidate pairs")]
    NoMatchingPairs,
    #[error("checklist already exists")]
    CheckListExists,
    #[error("checklist has not been created")]
    NoCheckList,
    #[error("ICE credentials are not set")]
    MissingCredentials,
    #[error("no candidate found")]
    NotFound,
    #[error("ICE negotiation in progress")]
    InProgress,

    #[error("ICE negotiation failed")]
    Failed,
    #[error("timed out waiting for nomination from the controlling agent")]
    NominationTimeout,

    #[error("STUN transaction timed out")]
    Timeout,
    #[error("STUN error response {0}")]
    StunError(u16),
    #[error("response source address does not match request destination")]
    SourceAddressMismatch,
    #[error("response is missing XOR-MAPPED-ADDRESS")]
    NoMappedAddress,
    #[error("check has been cancelled")]
    Cancelled,

    #[error("session has been destroyed")]
    Destroyed,
}
