#![deny(unreachable_pub, unsafe_code)]

//! sans io implementation of an ICE (RFC 5245) connectivity-check engine
//!
//! The [`IceSession`] holds local & remote candidates, builds the checklist, paces the connectivity
//! checks and reports the outcome exactly once through [`IceEvent::Complete`]. It never touches a socket,
//! packets to send are emitted as [`IceEvent::SendPacket`] and received packets are passed to
//! [`IceSession::receive`]. Time is driven by the caller through [`IceSession::poll`] and [`IceSession::timeout`].
//!
//! With the `tokio` feature [`tokio::SharedIceSession`] wraps a session in a mutex and drives its timers on a
//! tokio task.

use rand::distr::{Alphanumeric, SampleString};
use std::{fmt, net::SocketAddr};

mod candidate;
mod checklist;
mod config;
mod error;
mod session;
mod stun;

#[cfg(feature = "tokio")]
pub mod tokio;

pub use candidate::{Candidate, CandidateType, LocalCandidateId, RemoteCandidateId};
pub use checklist::{Check, CheckId, CheckState, Checklist, ChecklistState, pair_priority};
pub use config::{IceConfig, Nomination, StunConfig};
pub use error::Error;
pub use session::IceSession;

/// A message received on a UDP socket
pub struct ReceivedPkt<D = Vec<u8>> {
    /// The received data
    pub data: D,
    /// Source address of the message
    pub source: SocketAddr,
    /// Local socket destination address of the message
    pub destination: SocketAddr,
    /// On which component socket this was received
    pub component: Component,
}

/// Component id of a media stream, 1 based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Component(u8);

impl Component {
    /// The RTP component. This will also contain RTCP if rtcp-mux is used.
    pub const RTP: Self = Self(1);
    /// The RTCP component
    pub const RTCP: Self = Self(2);

    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "comp{}", self.0)
    }
}

/// Role of the local agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceRole {
    /// Decides which pair is nominated
    Controlling,
    /// Follows the nomination of the peer
    Controlled,
}

impl IceRole {
    pub(crate) fn flipped(self) -> Self {
        match self {
            IceRole::Controlling => IceRole::Controlled,
            IceRole::Controlled => IceRole::Controlling,
        }
    }
}

/// Short-term credentials of one ICE agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    /// Generate random credentials, 8 characters ufrag and 24 characters password
    pub fn random() -> Self {
        let mut rng = rand::rng();

        Self {
            ufrag: Alphanumeric.sample_string(&mut rng, 8),
            pwd: Alphanumeric.sample_string(&mut rng, 24),
        }
    }
}

/// State of gathering candidates from STUN servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IceGatheringState {
    /// Nothing to gather yet
    New,
    /// Waiting for responses of STUN servers
    Gathering,
    /// All STUN server bindings have either completed or failed
    Complete,
}

/// ICE related events emitted by the [`IceSession`]
#[derive(Debug)]
pub enum IceEvent {
    GatheringStateChanged {
        old: IceGatheringState,
        new: IceGatheringState,
    },
    /// Send `data` from the socket bound to `source` to `target`
    SendPacket {
        component: Component,
        source: SocketAddr,
        target: SocketAddr,
        data: Vec<u8>,
    },
    /// Non-STUN data received on a component
    ReceivedData {
        component: Component,
        source: SocketAddr,
        data: Vec<u8>,
    },
    /// A pair was nominated for the component
    Nominated {
        component: Component,
        local: SocketAddr,
        remote: SocketAddr,
    },
    /// Final outcome of the connectivity checks, emitted exactly once
    Complete(Result<(), Error>),
}
