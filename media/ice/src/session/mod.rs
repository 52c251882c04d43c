use crate::{
    Candidate, CandidateType, Component, Error, IceConfig, IceCredentials, IceEvent,
    IceGatheringState, IceRole, LocalCandidateId, ReceivedPkt, RemoteCandidateId,
    candidate::{calc_foundation, calc_priority},
    checklist::{CheckId, Checklist, ChecklistState},
    stun::StunTransactions,
};
use slotmap::SlotMap;
use std::{
    collections::VecDeque,
    mem::take,
    net::SocketAddr,
    time::{Duration, Instant},
};
use stun_types::{Class, Message, is_stun_message};

mod gather;
mod incoming;
mod scheduler;
mod valid;


use gather::ServerBinding;
use incoming::IncomingCheck;
use valid::ValidList;

/// Upper bound of ufrag and password (RFC 5245 15.4)
const MAX_CREDENTIAL_LEN: usize = 256;

struct ComponentState {
    id: Component,
    /// Address the component's socket is bound to
    local_addr: SocketAddr,
    /// Highest priority valid check
    valid: Option<CheckId>,
    nominated: Option<CheckId>,
}

/// Sans-IO ICE session of a single media stream
///
/// Candidates are added with [`add_cand`](IceSession::add_cand) or gathered, the remote candidates are
/// passed to [`create_check_list`](IceSession::create_check_list) and [`start_check`](IceSession::start_check)
/// begins the connectivity checks. From then on the session must be driven by [`poll`](IceSession::poll),
/// [`receive`](IceSession::receive) and [`pop_event`](IceSession::pop_event).
pub struct IceSession {
    config: IceConfig,
    role: IceRole,
    tie_breaker: u64,

    local_credentials: Option<IceCredentials>,
    remote_credentials: Option<IceCredentials>,

    components: Vec<ComponentState>,
    local_candidates: SlotMap<LocalCandidateId, Candidate>,
    remote_candidates: SlotMap<RemoteCandidateId, Candidate>,

    checklist: Option<Checklist>,
    valid_list: ValidList,
    transactions: StunTransactions,

    stun_servers: Vec<SocketAddr>,
    server_bindings: Vec<ServerBinding>,
    gathering_state: IceGatheringState,

    /// The controlling agent is repeating the checks of the best valid pairs with USE-CANDIDATE
    is_nominating: bool,
    last_ta_trigger: Option<Instant>,
    nominate_at: Option<Instant>,
    wait_nomination_until: Option<Instant>,
    /// `None` once armed means the interval is too large to ever elapse
    keep_alive_at: Option<Instant>,
    keep_alive_armed: bool,
    keep_alive_component: usize,

    /// Requests received before the checks were started
    early_checks: Vec<IncomingCheck>,

    completion: Option<Result<(), Error>>,
    events: VecDeque<IceEvent>,
    destroyed: bool,
}

impl IceSession {
    pub fn new(config: IceConfig, role: IceRole) -> Self {
        Self {
            config,
            role,
            tie_breaker: rand::random(),
            local_credentials: None,
            remote_credentials: None,
            components: vec![],
            local_candidates: SlotMap::with_key(),
            remote_candidates: SlotMap::with_key(),
            checklist: None,
            valid_list: ValidList::default(),
            transactions: StunTransactions::default(),
            stun_servers: vec![],
            server_bindings: vec![],
            gathering_state: IceGatheringState::New,
            is_nominating: false,
            last_ta_trigger: None,
            nominate_at: None,
            wait_nomination_until: None,
            keep_alive_at: None,
            keep_alive_armed: false,
            keep_alive_component: 0,
            early_checks: vec![],
            completion: None,
            events: VecDeque::new(),
            destroyed: false,
        }
    }

    pub fn config(&self) -> &IceConfig {
        &self.config
    }

    pub fn role(&self) -> IceRole {
        self.role
    }

    pub fn tie_breaker(&self) -> u64 {
        self.tie_breaker
    }

    /// Override the random tie-breaker used to resolve role conflicts
    pub fn set_tie_breaker(&mut self, tie_breaker: u64) {
        self.tie_breaker = tie_breaker;
    }

    /// Change the role, recomputing all pair priorities
    pub fn change_role(&mut self, role: IceRole) -> Result<(), Error> {
        self.ensure_alive()?;

        if self.role != role {
            self.set_role(role);
        }

        Ok(())
    }

    pub fn set_credentials(
        &mut self,
        local: IceCredentials,
        remote: IceCredentials,
    ) -> Result<(), Error> {
        self.ensure_alive()?;

        if local.ufrag.is_empty() || local.pwd.is_empty() {
            return Err(Error::InvalidArgument("empty local credentials"));
        }

        let too_long = [&local, &remote].into_iter().any(|credentials| {
            credentials.ufrag.len() > MAX_CREDENTIAL_LEN
                || credentials.pwd.len() > MAX_CREDENTIAL_LEN
        });

        if too_long {
            return Err(Error::InvalidArgument(
                "ufrag and password must not exceed 256 bytes",
            ));
        }

        self.local_credentials = Some(local);
        self.remote_credentials = Some(remote);

        Ok(())
    }

    pub fn local_credentials(&self) -> Option<&IceCredentials> {
        self.local_credentials.as_ref()
    }

    pub fn remote_credentials(&self) -> Option<&IceCredentials> {
        self.remote_credentials.as_ref()
    }

    /// Register a component and the address its socket is bound to.
    ///
    /// Components must be added in order, starting with [`Component::RTP`].
    pub fn add_comp(&mut self, comp_id: Component, local_addr: SocketAddr) -> Result<(), Error> {
        self.ensure_alive()?;

        if usize::from(comp_id.id()) != self.components.len() + 1 {
            return Err(Error::InvalidComponentId(comp_id.id()));
        }

        if self.components.len() >= self.config.max_components {
            return Err(Error::TooMany("components"));
        }

        if self.checklist.is_some() {
            return Err(Error::InvalidArgument(
                "components cannot be added after the checklist was created",
            ));
        }

        log::debug!("add {comp_id} bound to {local_addr}");

        self.components.push(ComponentState {
            id: comp_id,
            local_addr,
            valid: None,
            nominated: None,
        });

        Ok(())
    }

    pub fn comp_cnt(&self) -> usize {
        self.components.len()
    }

    /// Add a local candidate, computing its priority and (if not given) its foundation
    #[allow(clippy::too_many_arguments)]
    pub fn add_cand(
        &mut self,
        comp_id: Component,
        typ: CandidateType,
        local_pref: u16,
        foundation: Option<&str>,
        addr: SocketAddr,
        base_addr: SocketAddr,
        srv_addr: Option<SocketAddr>,
    ) -> Result<LocalCandidateId, Error> {
        self.ensure_alive()?;

        if self.checklist.is_some() {
            return Err(Error::InvalidArgument(
                "candidates cannot be added after the checklist was created",
            ));
        }

        if self.component(comp_id).is_none() {
            return Err(Error::InvalidComponentId(comp_id.id()));
        }

        self.insert_local_candidate(Candidate {
            comp_id,
            typ,
            prio: calc_priority(typ, local_pref, comp_id),
            foundation: foundation
                .map(str::to_owned)
                .unwrap_or_else(|| calc_foundation(typ, base_addr.ip())),
            addr,
            base_addr,
            srv_addr,
        })
    }

    fn insert_local_candidate(&mut self, candidate: Candidate) -> Result<LocalCandidateId, Error> {
        if self.local_candidates.len() >= self.config.max_candidates {
            return Err(Error::TooMany("local candidates"));
        }

        log::debug!(
            "add local candidate {candidate}, priority: {}, foundation: {}",
            candidate.prio,
            candidate.foundation
        );

        Ok(self.local_candidates.insert(candidate))
    }

    pub fn get_cand_cnt(&self) -> usize {
        self.local_candidates.len()
    }

    /// All local candidates in the order they were added
    pub fn enum_cands(&self) -> Vec<LocalCandidateId> {
        self.local_candidates.keys().collect()
    }

    pub fn get_cand(&self, id: LocalCandidateId) -> Result<&Candidate, Error> {
        self.local_candidates.get(id).ok_or(Error::InvalidCandidateId)
    }

    pub fn get_remote_cand(&self, id: RemoteCandidateId) -> Result<&Candidate, Error> {
        self.remote_candidates.get(id).ok_or(Error::InvalidCandidateId)
    }

    /// Candidate to put into the default destination of the SDP
    ///
    /// The local candidate of the best valid pair, else a relayed, reflexive or host candidate in that order.
    pub fn find_default_cand(&self, comp_id: Component) -> Result<LocalCandidateId, Error> {
        self.ensure_alive()?;

        if self.component(comp_id).is_none() {
            return Err(Error::InvalidComponentId(comp_id.id()));
        }

        if let Some(checklist) = &self.checklist {
            let valid = self
                .valid_list
                .as_slice()
                .iter()
                .map(|id| &checklist.checks[*id])
                .find(|check| check.comp_id == comp_id);

            if let Some(check) = valid {
                return Ok(check.local);
            }
        }

        let find = |matches: fn(CandidateType) -> bool| {
            self.local_candidates
                .iter()
                .find(|(_, c)| c.comp_id == comp_id && matches(c.typ))
                .map(|(id, _)| id)
        };

        find(|typ| typ == CandidateType::Relayed)
            .or_else(|| {
                find(|typ| {
                    matches!(
                        typ,
                        CandidateType::ServerReflexive | CandidateType::PeerReflexive
                    )
                })
            })
            .or_else(|| find(|typ| typ == CandidateType::Host))
            .ok_or(Error::NotFound)
    }

    /// Pair the local candidates with the given remote candidates
    ///
    /// Fails without changing the session if any remote candidate is rejected.
    pub fn create_check_list(&mut self, remote_candidates: &[Candidate]) -> Result<(), Error> {
        self.ensure_alive()?;

        if self.checklist.is_some() {
            return Err(Error::CheckListExists);
        }

        if remote_candidates.is_empty() {
            return Err(Error::InvalidArgument("no remote candidates"));
        }

        if remote_candidates.len() > self.config.max_candidates {
            return Err(Error::TooMany("remote candidates"));
        }

        if let Some(candidate) = remote_candidates
            .iter()
            .find(|c| self.component(c.comp_id).is_none())
        {
            return Err(Error::InvalidComponentId(candidate.comp_id.id()));
        }

        let mut remotes = SlotMap::with_key();

        for candidate in remote_candidates {
            log::debug!("add remote candidate {candidate}, priority: {}", candidate.prio);
            remotes.insert(candidate.clone());
        }

        let checklist = Checklist::build(
            &self.local_candidates,
            &remotes,
            self.role,
            self.config.max_checks,
        )?;

        self.remote_candidates = remotes;
        self.checklist = Some(checklist);

        Ok(())
    }

    /// Start the connectivity checks
    pub fn start_check(&mut self, now: Instant) -> Result<(), Error> {
        self.ensure_alive()?;

        let Some(checklist) = &mut self.checklist else {
            return Err(Error::NoCheckList);
        };

        if self.local_credentials.is_none() || self.remote_credentials.is_none() {
            return Err(Error::MissingCredentials);
        }

        if checklist.state != ChecklistState::Idle {
            return Err(Error::InvalidArgument("checks have already been started"));
        }

        log::debug!(
            "starting {} checks as {:?}",
            checklist.len(),
            self.role
        );

        checklist.state = ChecklistState::Running;
        self.last_ta_trigger = None;

        for check in take(&mut self.early_checks) {
            self.handle_incoming_check(now, check);
        }

        Ok(())
    }

    /// Receive a packet from one of the component sockets
    ///
    /// STUN messages are consumed by the session, everything else is returned as [`IceEvent::ReceivedData`].
    pub fn receive(&mut self, now: Instant, pkt: ReceivedPkt) -> Result<(), Error> {
        self.ensure_alive()?;

        if self.component(pkt.component).is_none() {
            return Err(Error::InvalidComponentId(pkt.component.id()));
        }

        if !is_stun_message(&pkt.data) {
            self.events.push_back(IceEvent::ReceivedData {
                component: pkt.component,
                source: pkt.source,
                data: pkt.data,
            });
            return Ok(());
        }

        let stun_msg = match Message::parse(pkt.data) {
            Ok(stun_msg) => stun_msg,
            Err(e) => {
                log::debug!("Failed to parse stun message from {}, {e}", pkt.source);
                return Ok(());
            }
        };

        if stun_msg.has_fingerprint()
            && let Err(e) = stun_msg.verify_fingerprint()
        {
            log::trace!(
                "Incoming STUN {:?} failed fingerprint check, {e}",
                stun_msg.class()
            );
            return Ok(());
        }

        let pkt = ReceivedPkt {
            data: stun_msg,
            source: pkt.source,
            destination: pkt.destination,
            component: pkt.component,
        };

        match pkt.data.class() {
            Class::Request => self.receive_request(now, pkt),
            Class::Indication => log::trace!("received binding indication from {}", pkt.source),
            Class::Success | Class::Error => self.receive_response(now, pkt),
        }

        Ok(())
    }

    /// Send application data over the nominated pair, or the best valid pair if none is nominated yet
    pub fn send_data(&mut self, comp_id: Component, data: Vec<u8>) -> Result<(), Error> {
        self.ensure_alive()?;

        let component = self
            .component(comp_id)
            .ok_or(Error::InvalidComponentId(comp_id.id()))?;

        let (source, target) = component
            .nominated
            .or(component.valid)
            .and_then(|id| self.pair(id))
            .map(|(local, remote)| (local.base_addr, remote.addr))
            .ok_or(Error::InProgress)?;

        self.events.push_back(IceEvent::SendPacket {
            component: comp_id,
            source,
            target,
            data,
        });

        Ok(())
    }

    /// Advance timers, must be called after [`timeout`](IceSession::timeout) expired
    pub fn poll(&mut self, now: Instant) {
        if self.destroyed {
            return;
        }

        self.poll_gathering(now);
        self.poll_transactions(now);
        self.poll_timers(now);
        self.poll_checks(now);
    }

    /// Time until [`poll`](IceSession::poll) must be called
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        if self.destroyed {
            return None;
        }

        let deadlines = [
            self.gathering_deadline(now),
            self.transactions.next_deadline(),
            self.next_check_deadline(now),
            self.nominate_at,
            self.wait_nomination_until,
            self.keep_alive_deadline(now),
        ];

        deadlines
            .into_iter()
            .flatten()
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    pub fn pop_event(&mut self) -> Option<IceEvent> {
        self.events.pop_front()
    }

    /// Stop the checks and complete with `reason`, unless already completed
    pub fn abort(&mut self, reason: Error) -> Result<(), Error> {
        self.ensure_alive()?;

        if self.completion.is_some() {
            return Ok(());
        }

        log::debug!("aborting ICE session, {reason}");

        self.transactions.cancel_all();
        self.fail_gathering();
        self.complete(Err(reason));

        Ok(())
    }

    /// Cancel all timers & transactions and drop all candidates and checks
    pub fn destroy(&mut self) -> Result<(), Error> {
        self.ensure_alive()?;

        log::debug!("destroying ICE session");

        self.transactions.cancel_all();
        self.last_ta_trigger = None;
        self.nominate_at = None;
        self.wait_nomination_until = None;
        self.keep_alive_at = None;
        self.keep_alive_armed = false;

        self.checklist = None;
        self.valid_list.clear();
        self.local_candidates.clear();
        self.remote_candidates.clear();
        self.components.clear();
        self.server_bindings.clear();
        self.stun_servers.clear();
        self.early_checks.clear();
        self.events.clear();

        self.destroyed = true;

        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn checklist(&self) -> Option<&Checklist> {
        self.checklist.as_ref()
    }

    /// State of the checklist, [`ChecklistState::Idle`] before it is created
    pub fn state(&self) -> ChecklistState {
        self.checklist
            .as_ref()
            .map_or(ChecklistState::Idle, |checklist| checklist.state)
    }

    /// Succeeded checks, highest priority first
    pub fn valid_list(&self) -> &[CheckId] {
        self.valid_list.as_slice()
    }

    /// Local and remote candidate of the component's nominated pair
    pub fn nominated_pair(&self, comp_id: Component) -> Option<(&Candidate, &Candidate)> {
        self.component(comp_id)?
            .nominated
            .and_then(|id| self.pair(id))
    }

    /// Outcome of the checks, once completed
    pub fn completion(&self) -> Option<&Result<(), Error>> {
        self.completion.as_ref()
    }

    fn ensure_alive(&self) -> Result<(), Error> {
        if self.destroyed {
            Err(Error::Destroyed)
        } else {
            Ok(())
        }
    }

    fn component(&self, comp_id: Component) -> Option<&ComponentState> {
        self.components.iter().find(|c| c.id == comp_id)
    }

    fn pair(&self, id: CheckId) -> Option<(&Candidate, &Candidate)> {
        let check = self.checklist.as_ref()?.checks.get(id)?;

        Some((
            self.local_candidates.get(check.local)?,
            self.remote_candidates.get(check.remote)?,
        ))
    }

    fn set_role(&mut self, role: IceRole) {
        log::debug!("switching role from {:?} to {role:?}", self.role);

        self.role = role;

        match role {
            IceRole::Controlling => self.wait_nomination_until = None,
            IceRole::Controlled => {
                self.is_nominating = false;
                self.nominate_at = None;
            }
        }

        if let Some(checklist) = &mut self.checklist {
            checklist.recompute_priorities(&self.local_candidates, &self.remote_candidates, role);
            self.valid_list.sort(checklist);
        }

        self.recompute_components();
    }
}
