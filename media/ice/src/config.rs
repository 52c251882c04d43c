use std::{cmp::min, time::Duration};

/// Retransmission policy of STUN transactions
#[derive(Debug, Clone)]
pub struct StunConfig {
    /// Delay before the first retransmit, doubled with every attempt
    pub initial_rto: Duration,
    /// Retransmits before a transaction times out
    pub max_retransmits: u32,
    /// Upper bound of the retransmit delay
    pub max_rto: Duration,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(250),
            max_retransmits: 7,
            max_rto: Duration::from_secs(3),
        }
    }
}

impl StunConfig {
    pub(crate) fn retransmit_delta(&self, attempts: u32) -> Duration {
        let rto = self.initial_rto.saturating_mul(1 << attempts.min(16));

        min(rto, self.max_rto)
    }
}

/// How the controlling agent nominates pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nomination {
    /// Let checks run, then repeat the check of the best valid pair with USE-CANDIDATE
    Regular,
    /// Every check carries USE-CANDIDATE
    Aggressive,
}

/// Limits and timers of an [`IceSession`](crate::IceSession)
#[derive(Debug, Clone)]
pub struct IceConfig {
    /// Maximum number of local and of remote candidates
    pub max_candidates: usize,
    /// Maximum number of checks in the checklist
    pub max_checks: usize,
    /// Maximum number of components
    pub max_components: usize,

    /// Pacing interval, at most one new check is started per interval
    pub ta: Duration,

    pub nomination: Nomination,
    /// How long the controlling agent waits for higher priority checks before nominating
    pub nominated_check_delay: Duration,
    /// How long the controlled agent waits for a nomination once all checks are done, `None` waits forever
    pub controlled_wait_nomination: Option<Duration>,

    /// Interval of keep-alive indications after completion, `None` disables them
    pub keep_alive_interval: Option<Duration>,
    /// Random amount added to each keep-alive interval
    pub keep_alive_jitter: Duration,

    pub stun: StunConfig,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            max_candidates: 16,
            max_checks: 32,
            max_components: 8,
            ta: Duration::from_millis(20),
            nomination: Nomination::Regular,
            nominated_check_delay: Duration::from_millis(400),
            controlled_wait_nomination: Some(Duration::from_secs(10)),
            keep_alive_interval: Some(Duration::from_secs(20)),
            keep_alive_jitter: Duration::from_secs(5),
            stun: StunConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retransmit_delta_doubles_until_max() {
        let config = StunConfig::default();

        assert_eq!(config.retransmit_delta(0), Duration::from_millis(250));
        assert_eq!(config.retransmit_delta(1), Duration::from_millis(500));
        assert_eq!(config.retransmit_delta(3), Duration::from_secs(2));
        assert_eq!(config.retransmit_delta(4), Duration::from_secs(3));
        assert_eq!(config.retransmit_delta(40), Duration::from_secs(3));
    }
}
