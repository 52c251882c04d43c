use super::IceSession;
use crate::{
    Candidate, CandidateType, Error, IceEvent, IceRole, Nomination, ReceivedPkt,
    candidate::{DisplayPair, calc_foundation, calc_priority},
    checklist::{Check, CheckId, CheckState, ChecklistState, pair_priority_for},
    stun::{self, Transaction, TransactionEvent, TransactionOwner},
};
use rand::Rng;
use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};
use stun_types::{Attribute, Class, ErrorCode, Message, TransactionId};

impl IceSession {
    pub(super) fn poll_transactions(&mut self, now: Instant) {
        for event in self.transactions.poll(now, &self.config.stun) {
            match event {
                TransactionEvent::Retransmit {
                    component,
                    source,
                    target,
                    data,
                } => {
                    log::trace!("retransmit STUN request {source} -> {target}");

                    self.events.push_back(IceEvent::SendPacket {
                        component,
                        source,
                        target,
                        data,
                    });
                }
                TransactionEvent::Timeout(TransactionOwner::Check { check, .. }) => {
                    self.fail_check(now, check, Error::Timeout);
                }
                TransactionEvent::Timeout(TransactionOwner::Gather { binding }) => {
                    self.on_gather_timeout(binding);
                }
            }
        }
    }

    pub(super) fn poll_timers(&mut self, now: Instant) {
        if self.nominate_at.is_some_and(|at| at <= now) {
            self.nominate_at = None;

            if self.completion.is_none() && self.role == IceRole::Controlling && !self.is_nominating {
                log::debug!("nomination delay expired");
                self.start_nominated_check();
            }
        }

        if self.wait_nomination_until.is_some_and(|at| at <= now) {
            self.wait_nomination_until = None;

            log::warn!("controlling agent did not nominate a pair in time");
            self.complete(Err(Error::NominationTimeout));
        }

        self.poll_keep_alive(now);
    }

    /// Start at most one check per Ta
    pub(super) fn poll_checks(&mut self, now: Instant) {
        if self.completion.is_some() {
            return;
        }

        if !self
            .checklist
            .as_ref()
            .is_some_and(|checklist| checklist.state == ChecklistState::Running)
        {
            return;
        }

        // An interval too large to represent never elapses
        if let Some(last) = self.last_ta_trigger
            && last.checked_add(self.config.ta).is_none_or(|next| next > now)
        {
            return;
        }

        let Some(id) = self.next_check() else {
            return;
        };

        self.last_ta_trigger = Some(now);
        self.perform_check(now, id);
    }

    /// Triggered checks first, then the highest priority waiting check, then the highest priority frozen one
    fn next_check(&mut self) -> Option<CheckId> {
        let nominating = self.is_nominating;
        let checklist = self.checklist.as_mut()?;

        while let Some(id) = checklist.triggered.pop_front() {
            if checklist.checks[id].state == CheckState::Waiting {
                return Some(id);
            }
        }

        let next = |state: CheckState| {
            checklist.order.iter().copied().find(|id| {
                let check = &checklist.checks[*id];
                check.state == state && (!nominating || check.nominated)
            })
        };

        next(CheckState::Waiting).or_else(|| next(CheckState::Frozen))
    }

    fn has_startable_check(&self) -> bool {
        let Some(checklist) = &self.checklist else {
            return false;
        };

        checklist.checks.values().any(|check| {
            matches!(check.state, CheckState::Waiting | CheckState::Frozen)
                && (!self.is_nominating || check.nominated)
        })
    }

    pub(super) fn next_check_deadline(&self, now: Instant) -> Option<Instant> {
        if self.completion.is_some() || self.state() != ChecklistState::Running {
            return None;
        }

        if !self.has_startable_check() {
            return None;
        }

        match self.last_ta_trigger {
            Some(last) => last.checked_add(self.config.ta),
            None => Some(now),
        }
    }

    fn perform_check(&mut self, now: Instant, id: CheckId) {
        let (Some(local_credentials), Some(remote_credentials)) =
            (&self.local_credentials, &self.remote_credentials)
        else {
            return;
        };

        let Some(checklist) = &mut self.checklist else {
            return;
        };

        let check = &mut checklist.checks[id];
        let local = &self.local_candidates[check.local];
        let remote = &self.remote_candidates[check.remote];

        let use_candidate = self.role == IceRole::Controlling
            && (check.nominated || self.config.nomination == Nomination::Aggressive);

        // PRIORITY carries the priority a peer reflexive candidate discovered by this check would have
        let local_index = self
            .local_candidates
            .keys()
            .position(|key| key == check.local)
            .unwrap_or_default();
        let local_pref = u16::try_from(local_index).map_or(0, |index| u16::MAX - index);
        let priority = calc_priority(CandidateType::PeerReflexive, local_pref, check.comp_id);

        let role_attr = match self.role {
            IceRole::Controlling => Attribute::IceControlling(self.tie_breaker),
            IceRole::Controlled => Attribute::IceControlled(self.tie_breaker),
        };

        let transaction_id = TransactionId::random();
        let request = stun::make_binding_request(
            transaction_id,
            local_credentials,
            remote_credentials,
            priority,
            role_attr,
            use_candidate,
        );

        log::debug!(
            "perform check {}, use-candidate: {use_candidate}",
            DisplayPair(local, remote)
        );

        self.transactions.start(
            now,
            &self.config.stun,
            transaction_id,
            TransactionOwner::Check {
                check: id,
                controlling: self.role == IceRole::Controlling,
                priority,
            },
            check.comp_id,
            local.base_addr,
            remote.addr,
            request.clone(),
        );

        self.events.push_back(IceEvent::SendPacket {
            component: check.comp_id,
            source: local.base_addr,
            target: remote.addr,
            data: request,
        });

        check.nominated |= use_candidate;
        check.transaction = Some(transaction_id);
        check.error = None;
        check.set_state(CheckState::InProgress);
    }

    pub(super) fn receive_response(&mut self, now: Instant, pkt: ReceivedPkt<Message>) {
        let transaction_id = pkt.data.transaction_id();

        let Some(transaction) = self.transactions.get(&transaction_id) else {
            log::trace!(
                "response from {} for unknown transaction {transaction_id:?}",
                pkt.source
            );
            return;
        };

        let (owner, server) = (transaction.owner, transaction.target);

        match owner {
            TransactionOwner::Gather { binding } => {
                if pkt.source != server {
                    log::debug!("STUN server response from unexpected address {}", pkt.source);
                    return;
                }

                self.transactions.take(&transaction_id);
                self.on_gather_response(binding, pkt.data);
            }
            TransactionOwner::Check {
                check,
                controlling,
                priority,
            } => {
                let Some(remote_credentials) = &self.remote_credentials else {
                    return;
                };

                if !stun::verify_response(&pkt.data, remote_credentials) {
                    return;
                }

                let Some(transaction) = self.transactions.take(&transaction_id) else {
                    return;
                };

                self.on_check_response(now, check, controlling, priority, transaction, pkt);
            }
        }
    }

    fn on_check_response(
        &mut self,
        now: Instant,
        id: CheckId,
        controlling: bool,
        priority: u32,
        transaction: Transaction,
        pkt: ReceivedPkt<Message>,
    ) {
        if self.completion.is_some() {
            return;
        }

        let Some(check) = self.checklist.as_ref().and_then(|c| c.checks.get(id)) else {
            return;
        };

        if check.state != CheckState::InProgress
            || check.transaction != Some(pkt.data.transaction_id())
        {
            return;
        }

        if pkt.source != transaction.target || pkt.destination != transaction.source {
            log::debug!(
                "response {} -> {} does not match request {} -> {}",
                pkt.source,
                pkt.destination,
                transaction.source,
                transaction.target
            );
            self.fail_check(now, id, Error::SourceAddressMismatch);
            return;
        }

        if pkt.data.class() == Class::Error {
            let code = pkt
                .data
                .error_code()
                .map_or(ErrorCode::SERVER_ERROR, |error_code| error_code.number);

            if code == ErrorCode::ROLE_CONFLICT {
                self.on_role_conflict(id, controlling);
            } else {
                self.fail_check(now, id, Error::StunError(code));
            }

            return;
        }

        match pkt.data.xor_mapped_address() {
            Some(mapped) => self.on_check_success(now, id, priority, mapped),
            None => self.fail_check(now, id, Error::NoMappedAddress),
        }
    }

    /// The peer answered with 487, switch role (unless that already happened) and retry the check
    fn on_role_conflict(&mut self, id: CheckId, sent_controlling: bool) {
        let sent_role = if sent_controlling {
            IceRole::Controlling
        } else {
            IceRole::Controlled
        };

        log::debug!("role conflict, peer rejected {sent_role:?}");

        if self.role == sent_role {
            self.set_role(sent_role.flipped());
        }

        let role = self.role;
        let Some(checklist) = &mut self.checklist else {
            return;
        };

        let check = &mut checklist.checks[id];
        check.transaction = None;
        if role == IceRole::Controlled {
            check.nominated = false;
        }
        check.set_state(CheckState::Waiting);

        checklist.triggered.retain(|other| *other != id);
        checklist.triggered.push_front(id);
    }

    fn on_check_success(&mut self, now: Instant, id: CheckId, priority: u32, mapped: SocketAddr) {
        let Some(checklist) = &self.checklist else {
            return;
        };

        let check = &checklist.checks[id];
        let (local_id, remote_id, comp_id) = (check.local, check.remote, check.comp_id);
        let base_addr = self.local_candidates[local_id].base_addr;

        // The local candidate of the valid pair is the one whose address was mapped
        let mapped_local = self
            .local_candidates
            .iter()
            .find(|(_, c)| c.comp_id == comp_id && c.addr == mapped && c.base_addr == base_addr)
            .map(|(id, _)| id);

        let valid_local = match mapped_local {
            Some(local) => local,
            None => {
                let candidate = Candidate {
                    comp_id,
                    typ: CandidateType::PeerReflexive,
                    prio: priority,
                    foundation: calc_foundation(CandidateType::PeerReflexive, base_addr.ip()),
                    addr: mapped,
                    base_addr,
                    srv_addr: None,
                };

                match self.insert_local_candidate(candidate) {
                    Ok(local) => local,
                    Err(e) => {
                        self.fail_check(now, id, e);
                        return;
                    }
                }
            }
        };

        let role = self.role;
        let Some(checklist) = &mut self.checklist else {
            return;
        };

        let valid_id = if valid_local == local_id {
            id
        } else if let Some(existing) = checklist.find(valid_local, remote_id) {
            existing
        } else {
            let local = &self.local_candidates[valid_local];
            let remote = &self.remote_candidates[remote_id];
            let foundation = checklist.foundation_index(local, remote);

            checklist.insert(Check {
                local: valid_local,
                remote: remote_id,
                comp_id,
                prio: pair_priority_for(local, remote, role),
                foundation,
                state: CheckState::Succeeded,
                nominated: false,
                transaction: None,
                error: None,
            })
        };

        let check = &mut checklist.checks[id];
        let nominated = check.nominated;
        check.transaction = None;
        check.set_state(CheckState::Succeeded);

        let valid = &mut checklist.checks[valid_id];
        if let Some(transaction_id) = valid.transaction.take() {
            self.transactions.cancel(&transaction_id);
        }
        valid.error = None;
        valid.state = CheckState::Succeeded;
        valid.nominated |= nominated;

        log::debug!(
            "check succeeded {}, nominated: {}",
            DisplayPair(
                &self.local_candidates[valid_local],
                &self.remote_candidates[remote_id]
            ),
            valid.nominated
        );

        let nominated = valid.nominated;

        self.valid_list.insert(checklist, valid_id);
        self.update_component(valid_id);

        self.unfreeze(id);

        if nominated {
            self.cancel_component_checks(comp_id, &[id, valid_id]);
        }

        self.check_ice_complete(now);
    }

    /// Move all frozen checks with the same foundation pair as `id` to waiting
    fn unfreeze(&mut self, id: CheckId) {
        let Some(checklist) = &mut self.checklist else {
            return;
        };

        let foundation = checklist.checks[id].foundation;

        for check in checklist.checks.values_mut() {
            if check.foundation == foundation && check.state == CheckState::Frozen {
                check.set_state(CheckState::Waiting);
            }
        }
    }

    pub(super) fn fail_check(&mut self, now: Instant, id: CheckId, error: Error) {
        let Some(checklist) = &mut self.checklist else {
            return;
        };

        let Some(check) = checklist.checks.get_mut(id) else {
            return;
        };

        log::debug!(
            "check failed {}, {error}",
            DisplayPair(
                &self.local_candidates[check.local],
                &self.remote_candidates[check.remote]
            )
        );

        if let Some(transaction_id) = check.transaction.take() {
            self.transactions.cancel(&transaction_id);
        }

        check.error = Some(error);
        check.set_state(CheckState::Failed);

        if self.valid_list.remove(id) {
            self.recompute_components();
        }

        self.check_ice_complete(now);
    }

    /// Decide if the checks are done, after every change of a check's state
    pub(super) fn check_ice_complete(&mut self, now: Instant) {
        if self.completion.is_some() {
            return;
        }

        let Some(checklist) = &self.checklist else {
            return;
        };

        if checklist.state != ChecklistState::Running {
            return;
        }

        if self.components.iter().all(|c| c.nominated.is_some()) {
            self.complete(Ok(()));
            return;
        }

        let missing_valid = self.components.iter().any(|c| c.valid.is_none());

        if !checklist.has_pending() {
            match self.role {
                IceRole::Controlled => {
                    if missing_valid {
                        self.complete(Err(Error::Failed));
                    } else if self.wait_nomination_until.is_none()
                        && let Some(wait) = self.config.controlled_wait_nomination
                    {
                        log::debug!("all checks done, waiting {wait:?} for nomination");
                        self.wait_nomination_until = now.checked_add(wait);
                    }
                }
                IceRole::Controlling => {
                    if missing_valid || self.is_nominating {
                        self.complete(Err(Error::Failed));
                    } else {
                        self.start_nominated_check();
                    }
                }
            }

            return;
        }

        if self.role != IceRole::Controlling
            || self.config.nomination != Nomination::Regular
            || self.is_nominating
            || missing_valid
        {
            return;
        }

        // Nominate right away if no pending check could still produce a better pair
        let outranked = self.components.iter().any(|component| {
            let Some(valid) = component.valid else {
                return true;
            };
            let valid_prio = checklist.checks[valid].prio;

            checklist
                .checks
                .values()
                .any(|c| c.comp_id == component.id && c.is_pending() && c.prio > valid_prio)
        });

        if !outranked {
            self.start_nominated_check();
        } else if self.nominate_at.is_none() {
            log::debug!(
                "all components have a valid pair, nominating in {:?}",
                self.config.nominated_check_delay
            );
            self.nominate_at = now.checked_add(self.config.nominated_check_delay);
        }
    }

    /// Repeat the checks of every component's best valid pair with USE-CANDIDATE
    pub(super) fn start_nominated_check(&mut self) {
        let Some(checklist) = &mut self.checklist else {
            return;
        };

        log::debug!("start nominating the best valid pairs");

        self.is_nominating = true;
        self.nominate_at = None;

        let valid: Vec<CheckId> = self.components.iter().filter_map(|c| c.valid).collect();

        for id in &checklist.order {
            let check = &mut checklist.checks[*id];

            if valid.contains(id) {
                check.nominated = true;
                check.set_state(CheckState::Waiting);
            } else if matches!(check.state, CheckState::Frozen | CheckState::Waiting) {
                check.error = Some(Error::Cancelled);
                check.set_state(CheckState::Failed);
            }
        }

        checklist.triggered.clear();
        checklist.triggered.extend(valid);
    }

    /// Report the outcome of the checks, only the first call has any effect
    pub(super) fn complete(&mut self, result: Result<(), Error>) {
        if self.completion.is_some() {
            return;
        }

        match &result {
            Ok(()) => log::debug!("ICE completed"),
            Err(e) => log::warn!("ICE failed, {e}"),
        }

        if let Some(checklist) = &mut self.checklist {
            checklist.state = ChecklistState::Completed;
            checklist.triggered.clear();

            for check in checklist.checks.values_mut() {
                if check.state == CheckState::InProgress {
                    check.transaction = None;
                    check.error = Some(Error::Cancelled);
                    check.set_state(CheckState::Failed);
                }
            }
        }

        self.transactions.cancel_checks();
        self.nominate_at = None;
        self.wait_nomination_until = None;

        self.completion = Some(result.clone());
        self.events.push_back(IceEvent::Complete(result));
    }

    fn poll_keep_alive(&mut self, now: Instant) {
        let Some(interval) = self.config.keep_alive_interval else {
            return;
        };

        if !matches!(self.completion, Some(Ok(()))) || self.components.is_empty() {
            return;
        }

        if !self.keep_alive_armed {
            self.keep_alive_armed = true;
            self.keep_alive_at = now.checked_add(self.keep_alive_delay(interval));
            return;
        }

        if self.keep_alive_at.is_none_or(|at| at > now) {
            return;
        }

        let index = self.keep_alive_component % self.components.len();
        self.keep_alive_component = self.keep_alive_component.wrapping_add(1);

        let component = &self.components[index];
        let target = component
            .nominated
            .and_then(|id| self.pair(id))
            .map(|(local, remote)| (component.id, local.base_addr, remote.addr));

        if let Some((component, source, target)) = target {
            log::trace!("send keep-alive {source} -> {target}");

            self.events.push_back(IceEvent::SendPacket {
                component,
                source,
                target,
                data: stun::make_keep_alive(),
            });
        }

        self.keep_alive_at = now.checked_add(self.keep_alive_delay(interval));
    }

    /// Keep-alives rotate over the components, so each one is refreshed once per interval
    fn keep_alive_delay(&self, interval: Duration) -> Duration {
        let jitter = u64::try_from(self.config.keep_alive_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter));

        let components = u32::try_from(self.components.len()).unwrap_or(u32::MAX).max(1);

        interval.saturating_add(jitter) / components
    }

    pub(super) fn keep_alive_deadline(&self, now: Instant) -> Option<Instant> {
        if self.config.keep_alive_interval.is_none()
            || !matches!(self.completion, Some(Ok(())))
            || self.components.is_empty()
        {
            return None;
        }

        if self.keep_alive_armed {
            self.keep_alive_at
        } else {
            Some(now)
        }
    }
}
