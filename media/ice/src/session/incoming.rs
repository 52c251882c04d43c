use super::IceSession;
use crate::{
    Candidate, CandidateType, Component, IceEvent, IceRole, ReceivedPkt,
    candidate::DisplayPair,
    checklist::{Check, CheckState, ChecklistState, pair_priority_for},
    stun,
};
use std::{net::SocketAddr, time::Instant};
use stun_types::{ErrorCode, Message, Method};

/// An authenticated binding request of the peer
pub(super) struct IncomingCheck {
    component: Component,
    source: SocketAddr,
    destination: SocketAddr,
    priority: u32,
    use_candidate: bool,
}

impl IceSession {
    pub(super) fn receive_request(&mut self, now: Instant, pkt: ReceivedPkt<Message>) {
        let stun_msg = &pkt.data;

        if stun_msg.method() != Method::Binding {
            log::debug!(
                "rejecting {:?} request from {}",
                stun_msg.method(),
                pkt.source
            );
            self.send_error_response(&pkt, ErrorCode::BAD_REQUEST, "Bad Request", false);
            return;
        }

        let Some(local_credentials) = &self.local_credentials else {
            log::debug!("received binding request before credentials were set");
            return;
        };

        if !stun::verify_request(stun_msg, local_credentials) {
            self.send_error_response(&pkt, ErrorCode::UNAUTHORIZED, "Unauthorized", false);
            return;
        }

        let Some(priority) = stun_msg.priority() else {
            log::debug!("binding request from {} without PRIORITY", pkt.source);
            self.send_error_response(&pkt, ErrorCode::BAD_REQUEST, "Missing PRIORITY", true);
            return;
        };

        if !self.resolve_role_conflict(stun_msg) {
            self.send_error_response(&pkt, ErrorCode::ROLE_CONFLICT, "Role Conflict", true);
            return;
        }

        let Some(local_credentials) = &self.local_credentials else {
            return;
        };

        let response = stun::make_success_response(
            stun_msg.transaction_id(),
            local_credentials,
            pkt.source,
        );

        self.events.push_back(IceEvent::SendPacket {
            component: pkt.component,
            source: pkt.destination,
            target: pkt.source,
            data: response,
        });

        let check = IncomingCheck {
            component: pkt.component,
            source: pkt.source,
            destination: pkt.destination,
            priority,
            use_candidate: stun_msg.use_candidate(),
        };

        if self.state() == ChecklistState::Idle {
            if self.early_checks.len() < self.config.max_checks {
                log::debug!("storing early check from {}", check.source);
                self.early_checks.push(check);
            } else {
                log::warn!("too many early checks, dropping check from {}", check.source);
            }

            return;
        }

        self.handle_incoming_check(now, check);
    }

    /// RFC 5245 7.2.1.1, returns false if the request must be answered with 487
    fn resolve_role_conflict(&mut self, stun_msg: &Message) -> bool {
        match (self.role, stun_msg.ice_controlling(), stun_msg.ice_controlled()) {
            (IceRole::Controlling, Some(remote_tie_breaker), _) => {
                if self.tie_breaker >= remote_tie_breaker {
                    log::debug!("role conflict, both controlling, keeping role");
                    return false;
                }

                self.set_role(IceRole::Controlled);
            }
            (IceRole::Controlled, _, Some(remote_tie_breaker)) => {
                if self.tie_breaker < remote_tie_breaker {
                    log::debug!("role conflict, both controlled, keeping role");
                    return false;
                }

                self.set_role(IceRole::Controlling);
            }
            _ => {}
        }

        true
    }

    fn send_error_response(
        &mut self,
        pkt: &ReceivedPkt<Message>,
        code: u16,
        reason: &str,
        authenticated: bool,
    ) {
        let credentials = if authenticated {
            self.local_credentials.as_ref()
        } else {
            None
        };

        let data = stun::make_error_response(
            pkt.data.transaction_id(),
            pkt.data.method(),
            code,
            reason,
            credentials,
        );

        self.events.push_back(IceEvent::SendPacket {
            component: pkt.component,
            source: pkt.destination,
            target: pkt.source,
            data,
        });
    }

    /// Trigger a check for the pair the peer just checked, learning a peer reflexive candidate if necessary
    pub(super) fn handle_incoming_check(&mut self, now: Instant, incoming: IncomingCheck) {
        if self.completion.is_some() {
            return;
        }

        let IncomingCheck {
            component,
            source,
            destination,
            priority,
            use_candidate,
        } = incoming;

        let remote_id = self
            .remote_candidates
            .iter()
            .find(|(_, c)| c.comp_id == component && c.addr == source)
            .map(|(id, _)| id);

        let remote_id = match remote_id {
            Some(remote_id) => remote_id,
            None => {
                if self.remote_candidates.len() >= self.config.max_candidates {
                    log::warn!("too many remote candidates, ignoring check from {source}");
                    return;
                }

                let candidate = Candidate {
                    comp_id: component,
                    typ: CandidateType::PeerReflexive,
                    prio: priority,
                    foundation: format!("~{:08x}", rand::random::<u32>()),
                    addr: source,
                    base_addr: source,
                    srv_addr: None,
                };

                log::debug!("learned remote candidate {candidate} from incoming check");

                self.remote_candidates.insert(candidate)
            }
        };

        let local_id = self
            .local_candidates
            .iter()
            .find(|(_, c)| {
                c.comp_id == component
                    && c.base_addr == destination
                    && matches!(c.typ, CandidateType::Host | CandidateType::Relayed)
            })
            .map(|(id, _)| id);

        let Some(local_id) = local_id else {
            log::warn!("no local candidate for {destination}, ignoring check from {source}");
            return;
        };

        let nominate = use_candidate && self.role == IceRole::Controlled;
        let role = self.role;

        let Some(checklist) = &mut self.checklist else {
            return;
        };

        let Some(id) = checklist.find(local_id, remote_id) else {
            if checklist.len() >= self.config.max_checks {
                log::warn!("checklist is full, ignoring check from {source}");
                return;
            }

            let local = &self.local_candidates[local_id];
            let remote = &self.remote_candidates[remote_id];
            let foundation = checklist.foundation_index(local, remote);

            log::debug!("add triggered check {}", DisplayPair(local, remote));

            let id = checklist.insert(Check {
                local: local_id,
                remote: remote_id,
                comp_id: component,
                prio: pair_priority_for(local, remote, role),
                foundation,
                state: CheckState::Waiting,
                nominated: nominate,
                transaction: None,
                error: None,
            });

            checklist.enqueue_triggered(id);
            return;
        };

        let check = &mut checklist.checks[id];

        match check.state {
            CheckState::Frozen | CheckState::Waiting | CheckState::Failed => {
                check.nominated |= nominate;

                log::trace!("trigger check of incoming pair, nominated: {}", check.nominated);

                check.error = None;
                check.set_state(CheckState::Waiting);
                checklist.enqueue_triggered(id);
            }
            CheckState::InProgress => {
                check.nominated |= nominate;

                if let Some(transaction_id) = check.transaction {
                    self.transactions.retransmit_now(&transaction_id, now);
                }
            }
            CheckState::Succeeded => {
                if nominate {
                    self.nominate_valid(now, id);
                }
            }
        }
    }
}
