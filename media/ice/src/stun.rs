//! STUN transactions and the messages exchanged during connectivity checks

use crate::{Component, IceCredentials, checklist::CheckId, config::StunConfig};
use std::{
    collections::HashMap,
    net::SocketAddr,
    time::Instant,
};
use stun_types::{Attribute, Class, ErrorCode, Message, MessageBuilder, Method, TransactionId};

/// Who is waiting for the outcome of a transaction
#[derive(Debug, Clone, Copy)]
pub(crate) enum TransactionOwner {
    Check {
        check: CheckId,
        /// Sent ICE-CONTROLLING instead of ICE-CONTROLLED
        controlling: bool,
        /// PRIORITY attribute of the request
        priority: u32,
    },
    /// Binding request to a STUN server to learn a server reflexive address
    Gather { binding: usize },
}

pub(crate) struct Transaction {
    pub(crate) owner: TransactionOwner,
    pub(crate) component: Component,
    pub(crate) source: SocketAddr,
    pub(crate) target: SocketAddr,

    request: Vec<u8>,
    retransmits: u32,
    /// `None` if the retransmit delay does not fit into an `Instant`, the transaction then never expires
    retransmit_at: Option<Instant>,
}

/// What happened to a transaction while polling
pub(crate) enum TransactionEvent {
    Retransmit {
        component: Component,
        source: SocketAddr,
        target: SocketAddr,
        data: Vec<u8>,
    },
    Timeout(TransactionOwner),
}

/// Pending STUN client transactions, indexed by transaction id.
///
/// Outcomes are handed back to the caller as values, a transaction that was cancelled or
/// whose owner went away simply never resolves.
#[derive(Default)]
pub(crate) struct StunTransactions {
    pending: HashMap<TransactionId, Transaction>,
}

impl StunTransactions {
    /// Register a request that has just been sent for the first time
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        &mut self,
        now: Instant,
        config: &StunConfig,
        transaction_id: TransactionId,
        owner: TransactionOwner,
        component: Component,
        source: SocketAddr,
        target: SocketAddr,
        request: Vec<u8>,
    ) {
        self.pending.insert(
            transaction_id,
            Transaction {
                owner,
                component,
                source,
                target,
                request,
                retransmits: 0,
                retransmit_at: now.checked_add(config.retransmit_delta(0)),
            },
        );
    }

    pub(crate) fn get(&self, transaction_id: &TransactionId) -> Option<&Transaction> {
        self.pending.get(transaction_id)
    }

    /// Remove a transaction because a response was received
    pub(crate) fn take(&mut self, transaction_id: &TransactionId) -> Option<Transaction> {
        self.pending.remove(transaction_id)
    }

    pub(crate) fn cancel(&mut self, transaction_id: &TransactionId) {
        if self.pending.remove(transaction_id).is_some() {
            log::trace!("cancelled transaction {transaction_id:?}");
        }
    }

    /// Cancel all transactions belonging to connectivity checks
    pub(crate) fn cancel_checks(&mut self) {
        self.pending
            .retain(|_, tsx| !matches!(tsx.owner, TransactionOwner::Check { .. }));
    }

    pub(crate) fn cancel_all(&mut self) {
        self.pending.clear();
    }

    /// Retransmit on the next poll, used when the peer sends a check for a pair that is in progress
    pub(crate) fn retransmit_now(&mut self, transaction_id: &TransactionId, now: Instant) {
        if let Some(tsx) = self.pending.get_mut(transaction_id) {
            tsx.retransmit_at = Some(now);
        }
    }

    pub(crate) fn poll(&mut self, now: Instant, config: &StunConfig) -> Vec<TransactionEvent> {
        let mut events = vec![];

        self.pending.retain(|_, tsx| {
            if tsx.retransmit_at.is_none_or(|at| at > now) {
                return true;
            }

            if tsx.retransmits >= config.max_retransmits {
                events.push(TransactionEvent::Timeout(tsx.owner));
                return false;
            }

            tsx.retransmits += 1;
            tsx.retransmit_at = now.checked_add(config.retransmit_delta(tsx.retransmits));

            events.push(TransactionEvent::Retransmit {
                component: tsx.component,
                source: tsx.source,
                target: tsx.target,
                data: tsx.request.clone(),
            });

            true
        });

        events
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().filter_map(|tsx| tsx.retransmit_at).min()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

pub(crate) fn make_binding_request(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
    remote_credentials: &IceCredentials,
    priority: u32,
    role_attr: Attribute,
    use_candidate: bool,
) -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(Class::Request, Method::Binding, transaction_id);

    stun_message.add_attr(Attribute::Username(format!(
        "{}:{}",
        remote_credentials.ufrag, local_credentials.ufrag
    )));
    stun_message.add_attr(Attribute::Priority(priority));
    stun_message.add_attr(role_attr);

    if use_candidate {
        stun_message.add_attr(Attribute::UseCandidate);
    }

    stun_message.add_message_integrity(remote_credentials.pwd.as_bytes());
    stun_message.add_fingerprint();

    stun_message.finish()
}

pub(crate) fn make_success_response(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
    source: SocketAddr,
) -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(Class::Success, Method::Binding, transaction_id);

    stun_message.add_attr(Attribute::XorMappedAddress(source));
    stun_message.add_message_integrity(local_credentials.pwd.as_bytes());
    stun_message.add_fingerprint();

    stun_message.finish()
}

/// Error response, signed with the local password if the request was authenticated
pub(crate) fn make_error_response(
    transaction_id: TransactionId,
    method: Method,
    code: u16,
    reason: &str,
    local_credentials: Option<&IceCredentials>,
) -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(Class::Error, method, transaction_id);

    stun_message.add_attr(Attribute::ErrorCode(ErrorCode::new(code, reason)));

    if let Some(credentials) = local_credentials {
        stun_message.add_message_integrity(credentials.pwd.as_bytes());
    }

    stun_message.add_fingerprint();

    stun_message.finish()
}

/// Binding indication sent to keep NAT bindings of nominated pairs alive
pub(crate) fn make_keep_alive() -> Vec<u8> {
    let mut stun_message =
        MessageBuilder::new(Class::Indication, Method::Binding, TransactionId::random());
    stun_message.add_fingerprint();
    stun_message.finish()
}

/// Unauthenticated binding request to a STUN server
pub(crate) fn make_server_binding_request(transaction_id: TransactionId) -> Vec<u8> {
    let mut stun_message = MessageBuilder::new(Class::Request, Method::Binding, transaction_id);
    stun_message.add_fingerprint();
    stun_message.finish()
}

/// Requests must carry `"<local ufrag>:<remote ufrag>"` and be signed with the local password
pub(crate) fn verify_request(stun_msg: &Message, local_credentials: &IceCredentials) -> bool {
    let Some(username) = stun_msg.username() else {
        log::debug!("STUN request is missing the USERNAME attribute");
        return false;
    };

    let username_ok = username
        .split_once(':')
        .is_some_and(|(local, _)| local == local_credentials.ufrag);

    if !username_ok {
        log::debug!("STUN request has unexpected USERNAME {username}");
        return false;
    }

    if let Err(e) = stun_msg.verify_integrity(local_credentials.pwd.as_bytes()) {
        log::debug!("STUN request failed integrity check, {e}");
        return false;
    }

    true
}

/// Error codes a peer sends without MESSAGE-INTEGRITY, when it could not (or must not) authenticate the request
const UNSIGNED_ERROR_CODES: [u16; 7] = [400, 401, 430, 431, 432, 434, 436];

/// Responses to our requests are signed with the remote password, except errors about the request itself
pub(crate) fn verify_response(stun_msg: &Message, remote_credentials: &IceCredentials) -> bool {
    if stun_msg.class() == Class::Error
        && !stun_msg.has_integrity()
        && let Some(error_code) = stun_msg.error_code()
    {
        return UNSIGNED_ERROR_CODES.contains(&error_code.number);
    }

    match stun_msg.verify_integrity(remote_credentials.pwd.as_bytes()) {
        Ok(()) => true,
        Err(e) => {
            log::debug!("STUN response failed integrity check, {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn creds(ufrag: &str, pwd: &str) -> IceCredentials {
        IceCredentials {
            ufrag: ufrag.into(),
            pwd: pwd.into(),
        }
    }

    #[test]
    fn binding_request_attributes() {
        let local = creds("loc", "localpassword");
        let remote = creds("rem", "remotepassword");

        let request = make_binding_request(
            TransactionId::random(),
            &local,
            &remote,
            1234,
            Attribute::IceControlling(99),
            true,
        );

        let msg = Message::parse(request).unwrap();

        assert_eq!(msg.username(), Some("rem:loc"));
        assert_eq!(msg.priority(), Some(1234));
        assert_eq!(msg.ice_controlling(), Some(99));
        assert!(msg.use_candidate());
        msg.verify_fingerprint().unwrap();

        // the remote agent verifies it with its own credentials
        assert!(verify_request(&msg, &remote));
        assert!(!verify_request(&msg, &local));
    }

    #[test]
    fn success_response_is_verified_with_remote_password() {
        let local = creds("loc", "localpassword");
        let addr: SocketAddr = "192.0.2.1:4000".parse().unwrap();

        let response = make_success_response(TransactionId::random(), &local, addr);
        let msg = Message::parse(response).unwrap();

        assert_eq!(msg.xor_mapped_address(), Some(addr));
        assert!(verify_response(&msg, &local));
        assert!(!verify_response(&msg, &creds("loc", "other")));
    }

    #[test]
    fn role_conflict_response() {
        let local = creds("loc", "localpassword");

        let response = make_error_response(
            TransactionId::random(),
            Method::Binding,
            ErrorCode::ROLE_CONFLICT,
            "Role Conflict",
            Some(&local),
        );
        let msg = Message::parse(response).unwrap();

        assert_eq!(msg.class(), Class::Error);
        assert_eq!(msg.error_code().unwrap().number, 487);
        assert!(verify_response(&msg, &local));
    }

    #[test]
    fn unsigned_error_responses() {
        let remote = creds("rem", "remotepassword");

        let unsigned = |code| {
            let response = make_error_response(
                TransactionId::random(),
                Method::Binding,
                code,
                "Error",
                None,
            );
            Message::parse(response).unwrap()
        };

        assert!(verify_response(&unsigned(ErrorCode::UNAUTHORIZED), &remote));
        assert!(verify_response(&unsigned(ErrorCode::BAD_REQUEST), &remote));
        // a role conflict must come from the authenticated peer
        assert!(!verify_response(&unsigned(ErrorCode::ROLE_CONFLICT), &remote));

        let signed_with_other = make_error_response(
            TransactionId::random(),
            Method::Binding,
            ErrorCode::UNAUTHORIZED,
            "Unauthorized",
            Some(&creds("rem", "other")),
        );
        assert!(!verify_response(
            &Message::parse(signed_with_other).unwrap(),
            &remote
        ));
    }

    #[test]
    fn retransmit_then_timeout() {
        let config = StunConfig {
            initial_rto: Duration::from_millis(100),
            max_retransmits: 2,
            max_rto: Duration::from_secs(1),
        };

        let mut transactions = StunTransactions::default();
        let start = Instant::now();
        let addr: SocketAddr = "10.0.0.1:1000".parse().unwrap();

        transactions.start(
            start,
            &config,
            TransactionId::random(),
            TransactionOwner::Gather { binding: 0 },
            Component::RTP,
            addr,
            addr,
            vec![1, 2, 3],
        );

        assert!(transactions.poll(start, &config).is_empty());
        assert_eq!(
            transactions.next_deadline(),
            Some(start + Duration::from_millis(100))
        );

        let t1 = start + Duration::from_millis(100);
        let events = transactions.poll(t1, &config);
        assert!(matches!(&events[..], [TransactionEvent::Retransmit { data, .. }] if data == &[1, 2, 3]));

        let t2 = t1 + Duration::from_millis(200);
        assert_eq!(transactions.poll(t2, &config).len(), 1);

        let t3 = t2 + Duration::from_millis(399);
        assert!(transactions.poll(t3, &config).is_empty());

        let events = transactions.poll(t3 + Duration::from_millis(1), &config);
        assert!(matches!(
            &events[..],
            [TransactionEvent::Timeout(TransactionOwner::Gather { binding: 0 })]
        ));
        assert_eq!(transactions.len(), 0);
    }
}
