use crate::Component;
use slotmap::new_key_type;
use std::{
    fmt,
    hash::{DefaultHasher, Hash, Hasher},
    net::{IpAddr, SocketAddr},
};

new_key_type!(
    /// Handle to a local candidate of an [`IceSession`](crate::IceSession)
    pub struct LocalCandidateId;
    /// Handle to a remote candidate of an [`IceSession`](crate::IceSession)
    pub struct RemoteCandidateId;
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    /// Address mapped by a STUN server
    ServerReflexive,
    /// Address learned from a connectivity check
    PeerReflexive,
    /// Address allocated on a TURN server
    Relayed,
}

impl CandidateType {
    pub const fn type_preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relayed => 0,
        }
    }

    fn foundation_prefix(self) -> char {
        match self {
            CandidateType::Host => 'H',
            CandidateType::ServerReflexive => 'S',
            CandidateType::PeerReflexive => 'P',
            CandidateType::Relayed => 'R',
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relayed => "relay",
        })
    }
}

/// A transport address at which an agent may be reachable for one component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub comp_id: Component,
    pub typ: CandidateType,
    pub prio: u32,
    pub foundation: String,
    pub addr: SocketAddr,
    /// Address the candidate was derived from, equal to `addr` for host candidates
    pub base_addr: SocketAddr,
    /// STUN/TURN server used to obtain the candidate
    pub srv_addr: Option<SocketAddr>,
}

impl Candidate {
    /// Create a candidate, computing priority and foundation
    pub fn new(
        comp_id: Component,
        typ: CandidateType,
        local_pref: u16,
        addr: SocketAddr,
        base_addr: SocketAddr,
    ) -> Self {
        Self {
            comp_id,
            typ,
            prio: calc_priority(typ, local_pref, comp_id),
            foundation: calc_foundation(typ, base_addr.ip()),
            addr,
            base_addr,
            srv_addr: None,
        }
    }

    /// Host candidate with the highest local preference
    pub fn host(comp_id: Component, addr: SocketAddr) -> Self {
        Self::new(comp_id, CandidateType::Host, u16::MAX, addr, addr)
    }

    /// Local preference encoded in the priority
    pub fn local_pref(&self) -> u16 {
        ((self.prio >> 8) & 0xFFFF) as u16
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.typ {
            CandidateType::Host => write!(f, "host({})", self.addr),
            typ => write!(f, "{typ}(base:{}, addr:{})", self.base_addr, self.addr),
        }
    }
}

/// `(type_pref << 24) + (local_pref << 8) + (256 - component)`
pub(crate) fn calc_priority(typ: CandidateType, local_pref: u16, comp_id: Component) -> u32 {
    (typ.type_preference() << 24) + (u32::from(local_pref) << 8) + (256 - u32::from(comp_id.id()))
}

/// Type prefix followed by the base address in hex for IPv4, a hash of it for IPv6
pub(crate) fn calc_foundation(typ: CandidateType, base: IpAddr) -> String {
    let prefix = typ.foundation_prefix();

    match base {
        IpAddr::V4(ip) => format!("{prefix}{:x}", u32::from(ip)),
        IpAddr::V6(ip) => {
            let mut hasher = DefaultHasher::new();
            ip.hash(&mut hasher);
            format!("{prefix}{:x}", hasher.finish() as u32)
        }
    }
}

/// Local candidate paired with a remote candidate, for log output
pub(crate) struct DisplayPair<'a>(pub(crate) &'a Candidate, pub(crate) &'a Candidate);

impl fmt::Display for DisplayPair<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.0.comp_id, self.0, self.1)
    }
}
