use super::IceSession;
use crate::{
    Component, Error, IceEvent,
    candidate::DisplayPair,
    checklist::{CheckId, CheckState, Checklist},
};
use std::time::Instant;

/// Succeeded checks ordered by descending pair priority, one entry per (local, remote) pair
#[derive(Debug, Default)]
pub(super) struct ValidList {
    checks: Vec<CheckId>,
}

impl ValidList {
    /// Returns false if the pair is already in the list
    pub(super) fn insert(&mut self, checklist: &Checklist, id: CheckId) -> bool {
        let check = &checklist.checks[id];

        let exists = self.checks.iter().any(|other| {
            let other = &checklist.checks[*other];
            other.local == check.local && other.remote == check.remote
        });

        if exists {
            return false;
        }

        let index = self
            .checks
            .iter()
            .position(|other| checklist.checks[*other].prio < check.prio)
            .unwrap_or(self.checks.len());

        self.checks.insert(index, id);

        true
    }

    pub(super) fn remove(&mut self, id: CheckId) -> bool {
        let len = self.checks.len();
        self.checks.retain(|other| *other != id);
        self.checks.len() != len
    }

    pub(super) fn contains(&self, id: CheckId) -> bool {
        self.checks.contains(&id)
    }

    pub(super) fn sort(&mut self, checklist: &Checklist) {
        self.checks
            .sort_by(|a, b| checklist.checks[*b].prio.cmp(&checklist.checks[*a].prio));
    }

    pub(super) fn as_slice(&self) -> &[CheckId] {
        &self.checks
    }

    pub(super) fn clear(&mut self) {
        self.checks.clear();
    }
}

impl IceSession {
    /// Update the best valid and nominated check of the component of `id`, which just became valid or nominated
    pub(super) fn update_component(&mut self, id: CheckId) {
        let Some(checklist) = &self.checklist else {
            return;
        };

        let check = &checklist.checks[id];
        let prio = |id: CheckId| checklist.checks[id].prio;

        let Some(component) = self.components.iter_mut().find(|c| c.id == check.comp_id) else {
            return;
        };

        if component.valid.is_none_or(|valid| prio(valid) < check.prio) {
            component.valid = Some(id);
        }

        if !check.nominated || component.nominated.is_some_and(|n| prio(n) >= check.prio) {
            return;
        }

        component.nominated = Some(id);

        let local = &self.local_candidates[check.local];
        let remote = &self.remote_candidates[check.remote];

        log::debug!("nominated {}", DisplayPair(local, remote));

        self.events.push_back(IceEvent::Nominated {
            component: check.comp_id,
            local: local.addr,
            remote: remote.addr,
        });
    }

    /// Rebuild the best valid and nominated check of every component from the valid list
    pub(super) fn recompute_components(&mut self) {
        let Some(checklist) = &self.checklist else {
            return;
        };

        for component in &mut self.components {
            let comp_id = component.id;
            let mut valid = self
                .valid_list
                .checks
                .iter()
                .copied()
                .filter(|id| checklist.checks[*id].comp_id == comp_id);

            component.valid = valid.clone().next();
            component.nominated = valid.find(|id| checklist.checks[*id].nominated);
        }
    }

    /// The peer nominated the pair of the succeeded check `id`
    pub(super) fn nominate_valid(&mut self, now: Instant, id: CheckId) {
        let Some(checklist) = &mut self.checklist else {
            return;
        };

        let check = &checklist.checks[id];

        // The check may have produced a valid pair with a peer reflexive local candidate on the same base
        let valid_id = if self.valid_list.contains(id) {
            Some(id)
        } else {
            let base = self.local_candidates[check.local].base_addr;

            self.valid_list.checks.iter().copied().find(|valid| {
                let valid = &checklist.checks[*valid];
                valid.remote == check.remote && self.local_candidates[valid.local].base_addr == base
            })
        };

        let Some(valid_id) = valid_id else {
            return;
        };

        let valid = &mut checklist.checks[valid_id];

        if valid.nominated {
            return;
        }

        valid.nominated = true;
        let comp_id = valid.comp_id;

        self.update_component(valid_id);
        self.cancel_component_checks(comp_id, &[id, valid_id]);
        self.check_ice_complete(now);
    }

    /// Fail all checks of the component that have not succeeded, except `keep`
    pub(super) fn cancel_component_checks(&mut self, comp_id: Component, keep: &[CheckId]) {
        let Some(checklist) = &mut self.checklist else {
            return;
        };

        for id in &checklist.order {
            if keep.contains(id) {
                continue;
            }

            let check = &mut checklist.checks[*id];

            if check.comp_id != comp_id || !check.is_pending() {
                continue;
            }

            if check.state == CheckState::InProgress
                && let Some(transaction_id) = check.transaction.take()
            {
                self.transactions.cancel(&transaction_id);
            }

            check.error = Some(Error::Cancelled);
            check.set_state(CheckState::Failed);
        }

        let checks = &checklist.checks;
        checklist
            .triggered
            .retain(|id| checks[*id].state == CheckState::Waiting);
    }
}
