use crate::{
    Component, Error, IceRole,
    candidate::{Candidate, CandidateType, DisplayPair, LocalCandidateId, RemoteCandidateId},
};
use slotmap::{SlotMap, new_key_type};
use std::{
    cmp::{max, min},
    collections::VecDeque,
    net::SocketAddr,
};
use stun_types::TransactionId;

new_key_type!(
    /// Handle to a check in the [`Checklist`]
    pub struct CheckId;
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

/// A local and remote candidate pair of the same component
#[derive(Debug, Clone)]
pub struct Check {
    pub(crate) local: LocalCandidateId,
    pub(crate) remote: RemoteCandidateId,
    pub(crate) comp_id: Component,
    pub(crate) prio: u64,
    /// Index into [`Checklist::foundations`]
    pub(crate) foundation: usize,
    pub(crate) state: CheckState,
    pub(crate) nominated: bool,
    pub(crate) transaction: Option<TransactionId>,
    pub(crate) error: Option<Error>,
}

impl Check {
    pub fn local(&self) -> LocalCandidateId {
        self.local
    }

    pub fn remote(&self) -> RemoteCandidateId {
        self.remote
    }

    pub fn comp_id(&self) -> Component {
        self.comp_id
    }

    pub fn prio(&self) -> u64 {
        self.prio
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    pub fn is_nominated(&self) -> bool {
        self.nominated
    }

    /// Reason of the failure if the check is [`CheckState::Failed`]
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(
            self.state,
            CheckState::Frozen | CheckState::Waiting | CheckState::InProgress
        )
    }

    pub(crate) fn set_state(&mut self, state: CheckState) {
        log::trace!("check {:?} {:?} -> {:?}", self.comp_id, self.state, state);
        self.state = state;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecklistState {
    /// Checks are built but not started
    Idle,
    Running,
    Completed,
}

/// All checks of an ICE session, ordered by descending pair priority
#[derive(Debug)]
pub struct Checklist {
    pub(crate) state: ChecklistState,
    pub(crate) checks: SlotMap<CheckId, Check>,
    pub(crate) order: Vec<CheckId>,
    /// Foundation pairs (`"local|remote"`) referenced by the checks
    pub(crate) foundations: Vec<String>,
    pub(crate) triggered: VecDeque<CheckId>,
}

impl Checklist {
    fn new() -> Self {
        Self {
            state: ChecklistState::Idle,
            checks: SlotMap::with_key(),
            order: vec![],
            foundations: vec![],
            triggered: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ChecklistState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterate over all checks, highest priority first
    pub fn checks(&self) -> impl Iterator<Item = (CheckId, &Check)> + '_ {
        self.order.iter().map(|id| (*id, &self.checks[*id]))
    }

    pub fn get(&self, id: CheckId) -> Option<&Check> {
        self.checks.get(id)
    }

    /// Foundation pair of the check
    pub fn foundation(&self, check: &Check) -> &str {
        &self.foundations[check.foundation]
    }

    pub(crate) fn find(&self, local: LocalCandidateId, remote: RemoteCandidateId) -> Option<CheckId> {
        self.order.iter().copied().find(|id| {
            let check = &self.checks[*id];
            check.local == local && check.remote == remote
        })
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.checks.values().any(Check::is_pending)
    }

    pub(crate) fn foundation_index(&mut self, local: &Candidate, remote: &Candidate) -> usize {
        let foundation = format!("{}|{}", local.foundation, remote.foundation);

        if let Some(index) = self.foundations.iter().position(|f| *f == foundation) {
            index
        } else {
            self.foundations.push(foundation);
            self.foundations.len() - 1
        }
    }

    /// Insert a check, keeping the priority order
    pub(crate) fn insert(&mut self, check: Check) -> CheckId {
        let prio = check.prio;
        let id = self.checks.insert(check);

        let index = self
            .order
            .iter()
            .position(|other| self.checks[*other].prio < prio)
            .unwrap_or(self.order.len());
        self.order.insert(index, id);

        id
    }

    pub(crate) fn enqueue_triggered(&mut self, id: CheckId) {
        if !self.triggered.contains(&id) {
            self.triggered.push_back(id);
        }
    }

    pub(crate) fn recompute_priorities(
        &mut self,
        local_candidates: &SlotMap<LocalCandidateId, Candidate>,
        remote_candidates: &SlotMap<RemoteCandidateId, Candidate>,
        role: IceRole,
    ) {
        for check in self.checks.values_mut() {
            check.prio = pair_priority_for(
                &local_candidates[check.local],
                &remote_candidates[check.remote],
                role,
            );
        }

        self.sort();
    }

    fn sort(&mut self) {
        let checks = &self.checks;
        self.order
            .sort_by(|a, b| checks[*b].prio.cmp(&checks[*a].prio));
    }

    /// Pair all local candidates with the remote candidates, prune, sort and cap them.
    pub(crate) fn build(
        local_candidates: &SlotMap<LocalCandidateId, Candidate>,
        remote_candidates: &SlotMap<RemoteCandidateId, Candidate>,
        role: IceRole,
        max_checks: usize,
    ) -> Result<Self, Error> {
        struct Pair {
            local: LocalCandidateId,
            remote: RemoteCandidateId,
            prio: u64,
        }

        let mut pairs = vec![];

        for (remote_id, remote) in remote_candidates {
            for (local_id, local) in local_candidates {
                if local.comp_id != remote.comp_id || !addr_compatible(local.addr, remote.addr) {
                    continue;
                }

                // Checks are sent from the base, so reflexive candidates are replaced by their host candidate.
                let local_id = match local.typ {
                    CandidateType::ServerReflexive | CandidateType::PeerReflexive => {
                        host_of(local_candidates, local)
                            .ok_or(Error::NoHostCandidate(local.base_addr))?
                    }
                    CandidateType::Host | CandidateType::Relayed => local_id,
                };

                pairs.push(Pair {
                    local: local_id,
                    remote: remote_id,
                    prio: pair_priority_for(local, remote, role),
                });
            }
        }

        if pairs.is_empty() {
            return Err(Error::NoMatchingPairs);
        }

        pairs.sort_by(|a, b| b.prio.cmp(&a.prio));

        // Remove pairs with the same remote candidate whose local candidates share a base,
        // only the first (highest priority) one is kept
        let mut pruned: Vec<Pair> = Vec::with_capacity(pairs.len());

        for pair in pairs {
            let base = local_candidates[pair.local].base_addr;

            let redundant = pruned.iter().any(|kept| {
                kept.remote == pair.remote && local_candidates[kept.local].base_addr == base
            });

            if redundant {
                log::trace!(
                    "pruning redundant pair {}",
                    DisplayPair(&local_candidates[pair.local], &remote_candidates[pair.remote])
                );
            } else {
                pruned.push(pair);
            }
        }

        if pruned.len() > max_checks {
            let components = |pairs: &[Pair]| {
                let mut components: Vec<Component> = pairs
                    .iter()
                    .map(|p| remote_candidates[p.remote].comp_id)
                    .collect();
                components.sort();
                components.dedup();
                components
            };

            let before = components(&pruned);
            pruned.truncate(max_checks);

            if components(&pruned) != before {
                log::warn!("checklist capped at {max_checks} checks would drop a component");
                return Err(Error::Failed);
            }
        }

        let mut checklist = Checklist::new();

        for pair in pruned {
            let local = &local_candidates[pair.local];
            let remote = &remote_candidates[pair.remote];

            let foundation = checklist.foundation_index(local, remote);

            // The first (highest priority) check of each foundation pair starts out waiting
            let state = if checklist
                .order
                .iter()
                .any(|id| checklist.checks[*id].foundation == foundation)
            {
                CheckState::Frozen
            } else {
                CheckState::Waiting
            };

            log::debug!(
                "add check {}, priority: {}, state: {state:?}",
                DisplayPair(local, remote),
                pair.prio
            );

            let id = checklist.checks.insert(Check {
                local: pair.local,
                remote: pair.remote,
                comp_id: local.comp_id,
                prio: pair.prio,
                foundation,
                state,
                nominated: false,
                transaction: None,
                error: None,
            });

            checklist.order.push(id);
        }

        Ok(checklist)
    }
}

/// `2^32 * min(G, D) + 2 * max(G, D) + (G > D ? 1 : 0)`
///
/// `g` is the priority of the controlling agent's candidate, `d` the controlled agent's.
pub fn pair_priority(g: u32, d: u32) -> u64 {
    let (g, d) = (u64::from(g), u64::from(d));

    (1 << 32) * min(g, d) + 2 * max(g, d) + u64::from(g > d)
}

pub(crate) fn pair_priority_for(local: &Candidate, remote: &Candidate, role: IceRole) -> u64 {
    match role {
        IceRole::Controlling => pair_priority(local.prio, remote.prio),
        IceRole::Controlled => pair_priority(remote.prio, local.prio),
    }
}

fn host_of(
    local_candidates: &SlotMap<LocalCandidateId, Candidate>,
    candidate: &Candidate,
) -> Option<LocalCandidateId> {
    local_candidates.iter().find_map(|(id, c)| {
        (c.typ == CandidateType::Host
            && c.comp_id == candidate.comp_id
            && c.addr == candidate.base_addr)
            .then_some(id)
    })
}

/// Same address family, IPv6 link-local only pairs with link-local
fn addr_compatible(local: SocketAddr, remote: SocketAddr) -> bool {
    match (local, remote) {
        (SocketAddr::V4(_), SocketAddr::V4(_)) => true,
        (SocketAddr::V6(l), SocketAddr::V6(r)) => {
            l.ip().is_unicast_link_local() == r.ip().is_unicast_link_local()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(
        locals: &[Candidate],
        remotes: &[Candidate],
    ) -> (
        SlotMap<LocalCandidateId, Candidate>,
        SlotMap<RemoteCandidateId, Candidate>,
    ) {
        let mut l = SlotMap::with_key();
        let mut r = SlotMap::with_key();

        for c in locals {
            l.insert(c.clone());
        }
        for c in remotes {
            r.insert(c.clone());
        }

        (l, r)
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn pair_priority_formula_random() {
        for _ in 0..10_000 {
            let g: u32 = rand::random();
            let d: u32 = rand::random();

            let expected = (1u128 << 32) * u128::from(g.min(d))
                + 2 * u128::from(g.max(d))
                + if g > d { 1 } else { 0 };

            assert_eq!(u128::from(pair_priority(g, d)), expected);

            if g < u32::MAX {
                assert!(pair_priority(g + 1, d) > pair_priority(g, d));
            }
            if d < u32::MAX {
                assert!(pair_priority(g, d + 1) > pair_priority(g, d));
            }
        }
    }

    #[test]
    fn pair_priority_edges() {
        assert_eq!(pair_priority(0, 0), 0);
        assert_eq!(pair_priority(1, 0), 3);
        assert_eq!(pair_priority(0, 1), 2);
        assert_eq!(
            pair_priority(u32::MAX, u32::MAX),
            (1 << 32) * u64::from(u32::MAX) + 2 * u64::from(u32::MAX)
        );
    }

    #[test]
    fn role_decides_g_and_d() {
        let local = Candidate::host(Component::RTP, addr("10.0.0.1:1000"));
        let mut remote = Candidate::host(Component::RTP, addr("10.0.0.2:2000"));
        remote.prio -= 1000;

        assert_eq!(
            pair_priority_for(&local, &remote, IceRole::Controlling),
            pair_priority(local.prio, remote.prio)
        );
        assert_eq!(
            pair_priority_for(&local, &remote, IceRole::Controlled),
            pair_priority(remote.prio, local.prio)
        );
        assert_eq!(
            pair_priority_for(&local, &remote, IceRole::Controlling),
            pair_priority_for(&local, &remote, IceRole::Controlled) + 1
        );
    }

    #[test]
    fn build_sorted_descending() {
        let (l, r) = candidates(
            &[
                Candidate::new(Component::RTP, CandidateType::Host, 100, addr("10.0.0.1:1000"), addr("10.0.0.1:1000")),
                Candidate::new(Component::RTP, CandidateType::Host, 200, addr("10.0.0.2:1000"), addr("10.0.0.2:1000")),
                Candidate::new(Component::RTCP, CandidateType::Host, 300, addr("10.0.0.3:1001"), addr("10.0.0.3:1001")),
                Candidate::new(Component::RTP, CandidateType::Relayed, 300, addr("1.2.3.4:3000"), addr("10.0.0.1:1000")),
            ],
            &[
                Candidate::new(Component::RTP, CandidateType::Host, 5, addr("10.1.0.1:2000"), addr("10.1.0.1:2000")),
                Candidate::new(Component::RTP, CandidateType::ServerReflexive, 7, addr("5.6.7.8:2000"), addr("10.1.0.1:2000")),
                Candidate::new(Component::RTCP, CandidateType::Host, 9, addr("10.1.0.1:2001"), addr("10.1.0.1:2001")),
            ],
        );

        let checklist = Checklist::build(&l, &r, IceRole::Controlling, 32).unwrap();

        let prios: Vec<u64> = checklist.checks().map(|(_, c)| c.prio).collect();
        assert!(prios.windows(2).all(|w| w[0] >= w[1]));
        assert!(!checklist.is_empty());
        assert_eq!(checklist.state(), ChecklistState::Idle);

        for (_, check) in checklist.checks() {
            assert_eq!(l[check.local].comp_id, r[check.remote].comp_id);
        }
    }

    #[test]
    fn prune_pairs_with_same_base() {
        let host = Candidate::host(Component::RTP, addr("10.0.0.1:1000"));
        let mut srflx = Candidate::new(
            Component::RTP,
            CandidateType::ServerReflexive,
            u16::MAX,
            addr("1.2.3.4:4000"),
            addr("10.0.0.1:1000"),
        );
        srflx.srv_addr = Some(addr("9.9.9.9:3478"));
        let remote = Candidate::host(Component::RTP, addr("10.1.0.1:2000"));

        let (l, r) = candidates(&[srflx.clone(), host.clone()], &[remote.clone()]);

        let checklist = Checklist::build(&l, &r, IceRole::Controlling, 32).unwrap();

        assert_eq!(checklist.len(), 1);

        let (_, check) = checklist.checks().next().unwrap();
        assert_eq!(l[check.local], host);
        assert_eq!(check.prio, pair_priority(host.prio, remote.prio));
        assert_ne!(check.prio, pair_priority(srflx.prio, remote.prio));
    }

    #[test]
    fn reflexive_without_host_fails() {
        let srflx = Candidate::new(
            Component::RTP,
            CandidateType::ServerReflexive,
            u16::MAX,
            addr("1.2.3.4:4000"),
            addr("10.0.0.1:1000"),
        );
        let remote = Candidate::host(Component::RTP, addr("10.1.0.1:2000"));

        let (l, r) = candidates(&[srflx], &[remote]);

        assert_eq!(
            Checklist::build(&l, &r, IceRole::Controlling, 32).unwrap_err(),
            Error::NoHostCandidate(addr("10.0.0.1:1000"))
        );
    }

    #[test]
    fn incompatible_families_are_not_paired() {
        let (l, r) = candidates(
            &[
                Candidate::host(Component::RTP, addr("10.0.0.1:1000")),
                Candidate::host(Component::RTP, addr("[fe80::1]:1000")),
            ],
            &[
                Candidate::host(Component::RTP, addr("[2001:db8::2]:2000")),
                Candidate::host(Component::RTCP, addr("10.1.0.1:2001")),
            ],
        );

        assert_eq!(
            Checklist::build(&l, &r, IceRole::Controlling, 32).unwrap_err(),
            Error::NoMatchingPairs
        );
    }

    #[test]
    fn initial_state_by_foundation() {
        // Two components on the same addresses share a foundation pair
        let (l, r) = candidates(
            &[
                Candidate::host(Component::RTP, addr("10.0.0.1:1000")),
                Candidate::host(Component::RTCP, addr("10.0.0.1:1001")),
                Candidate::host(Component::RTP, addr("10.0.0.2:1000")),
            ],
            &[
                Candidate::host(Component::RTP, addr("10.1.0.1:2000")),
                Candidate::host(Component::RTCP, addr("10.1.0.1:2001")),
            ],
        );

        let checklist = Checklist::build(&l, &r, IceRole::Controlling, 32).unwrap();
        assert_eq!(checklist.len(), 3);

        let state_of = |local: SocketAddr| {
            checklist
                .checks()
                .find(|(_, c)| l[c.local].addr == local)
                .map(|(_, c)| c.state)
                .unwrap()
        };

        assert_eq!(state_of(addr("10.0.0.1:1000")), CheckState::Waiting);
        assert_eq!(state_of(addr("10.0.0.1:1001")), CheckState::Frozen);
        assert_eq!(state_of(addr("10.0.0.2:1000")), CheckState::Waiting);
    }

    #[test]
    fn cap_keeps_highest_priority() {
        let locals: Vec<Candidate> = (1..=5)
            .map(|i| {
                Candidate::new(
                    Component::RTP,
                    CandidateType::Host,
                    i * 100,
                    addr(&format!("10.0.0.{i}:1000")),
                    addr(&format!("10.0.0.{i}:1000")),
                )
            })
            .collect();
        let (l, r) = candidates(&locals, &[Candidate::host(Component::RTP, addr("10.1.0.1:2000"))]);

        let checklist = Checklist::build(&l, &r, IceRole::Controlling, 3).unwrap();
        assert_eq!(checklist.len(), 3);

        let kept: Vec<u16> = checklist.checks().map(|(_, c)| l[c.local].local_pref()).collect();
        assert_eq!(kept, [500, 400, 300]);
    }

    #[test]
    fn cap_dropping_a_component_fails() {
        let (l, r) = candidates(
            &[
                Candidate::host(Component::RTP, addr("10.0.0.1:1000")),
                Candidate::host(Component::RTP, addr("10.0.0.2:1000")),
                Candidate::host(Component::RTCP, addr("10.0.0.1:1001")),
            ],
            &[
                Candidate::host(Component::RTP, addr("10.1.0.1:2000")),
                Candidate::host(Component::RTCP, addr("10.1.0.1:2001")),
            ],
        );

        assert_eq!(
            Checklist::build(&l, &r, IceRole::Controlling, 2).unwrap_err(),
            Error::Failed
        );
    }

    #[test]
    fn insert_keeps_order() {
        let (l, r) = candidates(
            &[
                Candidate::host(Component::RTP, addr("10.0.0.1:1000")),
                Candidate::new(Component::RTP, CandidateType::Host, 1, addr("10.0.0.2:1000"), addr("10.0.0.2:1000")),
            ],
            &[Candidate::host(Component::RTP, addr("10.1.0.1:2000"))],
        );

        let mut checklist = Checklist::build(&l, &r, IceRole::Controlling, 32).unwrap();
        let (_, first) = checklist.checks().next().unwrap();
        let mut check = first.clone();
        check.prio = first.prio - 1;

        let id = checklist.insert(check);
        assert_eq!(checklist.order[1], id);

        let prios: Vec<u64> = checklist.checks().map(|(_, c)| c.prio).collect();
        assert!(prios.windows(2).all(|w| w[0] >= w[1]));
    }
}
