use super::IceSession;
use crate::{
    Candidate, CandidateType, Error, IceEvent, IceGatheringState, LocalCandidateId,
    candidate::{calc_foundation, calc_priority},
    stun::{self, TransactionOwner},
};
use std::{net::SocketAddr, time::Instant};
use stun_types::{Class, Message, TransactionId};

/// Binding of one host candidate on a STUN server
pub(super) struct ServerBinding {
    server: SocketAddr,
    host: LocalCandidateId,
    state: BindingState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindingState {
    /// Request not sent yet
    Pending,
    InProgress,
    Done,
    Failed,
}

impl IceSession {
    /// Add a host candidate for every component using the address the component's socket is bound to
    pub fn gather_host_candidates(&mut self) -> Result<(), Error> {
        self.ensure_alive()?;

        let missing: Vec<_> = self
            .components
            .iter()
            .filter(|component| {
                !self.local_candidates.values().any(|c| {
                    c.comp_id == component.id
                        && c.typ == CandidateType::Host
                        && c.addr == component.local_addr
                })
            })
            .map(|component| (component.id, component.local_addr))
            .collect();

        for (comp_id, addr) in missing {
            self.add_cand(comp_id, CandidateType::Host, u16::MAX, None, addr, addr, None)?;
        }

        Ok(())
    }

    /// Use the STUN server to discover server reflexive candidates of all host candidates
    ///
    /// Requests are sent on the next [`poll`](IceSession::poll).
    pub fn add_stun_server(&mut self, server: SocketAddr) -> Result<(), Error> {
        self.ensure_alive()?;

        if self.checklist.is_some() {
            return Err(Error::InvalidArgument(
                "STUN servers cannot be added after the checklist was created",
            ));
        }

        if !self.stun_servers.contains(&server) {
            self.stun_servers.push(server);
        }

        Ok(())
    }

    pub fn gathering_state(&self) -> IceGatheringState {
        self.gathering_state
    }

    pub(super) fn poll_gathering(&mut self, now: Instant) {
        if self.checklist.is_none() {
            for server in &self.stun_servers {
                for (host, candidate) in &self.local_candidates {
                    let needs_binding = candidate.typ == CandidateType::Host
                        && candidate.addr.is_ipv4() == server.is_ipv4()
                        && !self
                            .server_bindings
                            .iter()
                            .any(|b| b.server == *server && b.host == host);

                    if needs_binding {
                        self.server_bindings.push(ServerBinding {
                            server: *server,
                            host,
                            state: BindingState::Pending,
                        });
                    }
                }
            }
        }

        for (index, binding) in self.server_bindings.iter_mut().enumerate() {
            if binding.state != BindingState::Pending {
                continue;
            }

            let Some(host) = self.local_candidates.get(binding.host) else {
                binding.state = BindingState::Failed;
                continue;
            };

            let transaction_id = TransactionId::random();
            let request = stun::make_server_binding_request(transaction_id);

            log::debug!(
                "sending binding request to STUN server {} from {}",
                binding.server,
                host.base_addr
            );

            self.transactions.start(
                now,
                &self.config.stun,
                transaction_id,
                TransactionOwner::Gather { binding: index },
                host.comp_id,
                host.base_addr,
                binding.server,
                request.clone(),
            );

            self.events.push_back(IceEvent::SendPacket {
                component: host.comp_id,
                source: host.base_addr,
                target: binding.server,
                data: request,
            });

            binding.state = BindingState::InProgress;
        }

        self.update_gathering_state();
    }

    pub(super) fn gathering_deadline(&self, now: Instant) -> Option<Instant> {
        let has_work = self
            .server_bindings
            .iter()
            .any(|b| b.state == BindingState::Pending)
            || (self.checklist.is_none()
                && self.stun_servers.iter().any(|server| {
                    self.local_candidates.iter().any(|(host, c)| {
                        c.typ == CandidateType::Host
                            && c.addr.is_ipv4() == server.is_ipv4()
                            && !self
                                .server_bindings
                                .iter()
                                .any(|b| b.server == *server && b.host == host)
                    })
                }));

        has_work.then_some(now)
    }

    pub(super) fn on_gather_response(&mut self, index: usize, stun_msg: Message) {
        let Some(binding) = self.server_bindings.get_mut(index) else {
            return;
        };

        let mapped = match (stun_msg.class(), stun_msg.xor_mapped_address()) {
            (Class::Success, Some(mapped)) => mapped,
            (Class::Success, None) => {
                log::warn!("STUN server {} response without XOR-MAPPED-ADDRESS", binding.server);
                binding.state = BindingState::Failed;
                self.update_gathering_state();
                return;
            }
            _ => {
                log::warn!(
                    "STUN server {} responded with error {:?}",
                    binding.server,
                    stun_msg.error_code()
                );
                binding.state = BindingState::Failed;
                self.update_gathering_state();
                return;
            }
        };

        binding.state = BindingState::Done;
        let server = binding.server;

        let candidate = self.local_candidates.get(binding.host).and_then(|host| {
            if mapped == host.addr {
                log::debug!("STUN server {server} reports the host address {mapped}");
                return None;
            }

            let exists = self
                .local_candidates
                .values()
                .any(|c| c.addr == mapped && c.base_addr == host.base_addr);

            (!exists).then(|| {
                let typ = CandidateType::ServerReflexive;

                Candidate {
                    comp_id: host.comp_id,
                    typ,
                    prio: calc_priority(typ, host.local_pref(), host.comp_id),
                    foundation: calc_foundation(typ, host.base_addr.ip()),
                    addr: mapped,
                    base_addr: host.base_addr,
                    srv_addr: Some(server),
                }
            })
        });

        if let Some(candidate) = candidate
            && let Err(e) = self.insert_local_candidate(candidate)
        {
            log::warn!("failed to add server reflexive candidate {mapped}, {e}");
        }

        self.update_gathering_state();
    }

    pub(super) fn on_gather_timeout(&mut self, index: usize) {
        if let Some(binding) = self.server_bindings.get_mut(index) {
            log::warn!("STUN server {} did not respond", binding.server);
            binding.state = BindingState::Failed;
        }

        self.update_gathering_state();
    }

    /// Fail all bindings that are still waiting for a response
    pub(super) fn fail_gathering(&mut self) {
        for binding in &mut self.server_bindings {
            if matches!(binding.state, BindingState::Pending | BindingState::InProgress) {
                binding.state = BindingState::Failed;
            }
        }

        self.update_gathering_state();
    }

    fn update_gathering_state(&mut self) {
        if self.server_bindings.is_empty() {
            return;
        }

        let new = if self
            .server_bindings
            .iter()
            .any(|b| matches!(b.state, BindingState::Pending | BindingState::InProgress))
        {
            IceGatheringState::Gathering
        } else {
            IceGatheringState::Complete
        };

        if new == self.gathering_state {
            return;
        }

        log::debug!("gathering state {:?} -> {new:?}", self.gathering_state);

        self.events.push_back(IceEvent::GatheringStateChanged {
            old: self.gathering_state,
            new,
        });
        self.gathering_state = new;
    }
}
