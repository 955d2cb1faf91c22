//! Outcome resolution: maps a cycle's filter/consume results to a broker action.
//!
//! | filter  | consume | policy       | action      | stop         | fatal |
//! |---------|---------|--------------|-------------|--------------|-------|
//! | halted  | -       | -            | halt action | if requested | no    |
//! | proceed | ok      | -            | acknowledge | if requested | no    |
//! | proceed | failed  | Ignore       | acknowledge | if requested | no    |
//! | proceed | failed  | Requeue      | requeue     | if requested | no    |
//! | proceed | failed  | Abort        | requeue     | always       | yes   |
//! | proceed | failed  | Unrecognized | requeue     | always       | yes   |
//!
//! Resolution is a pure function of its inputs.

use crate::config::HaltAction;
use crate::consumer::Policy;
use crate::filter::FilterOutcome;

/// What happened when the consumer ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// `consume` was not called (a filter halted).
    Skipped,
    Succeeded,
    /// `consume` failed and `on_error` chose this policy.
    Failed(Policy),
}

/// The single broker action issued for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerAction {
    Acknowledge,
    Requeue,
}

impl BrokerAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Acknowledge => "acknowledge",
            Self::Requeue => "requeue",
        }
    }
}

/// Resolved outcome of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub action: BrokerAction,
    /// Stop the loop regardless of explicit termination requests.
    pub terminate: bool,
    /// The cycle ended the run as failed.
    pub fatal: bool,
}

impl Resolution {
    fn settle(action: BrokerAction) -> Self {
        Self {
            action,
            terminate: false,
            fatal: false,
        }
    }

    fn fatal() -> Self {
        Self {
            action: BrokerAction::Requeue,
            terminate: true,
            fatal: true,
        }
    }
}

/// Turns cycle results into a [`Resolution`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OutcomeResolver {
    halt_action: HaltAction,
}

impl OutcomeResolver {
    pub fn new(halt_action: HaltAction) -> Self {
        Self { halt_action }
    }

    pub fn resolve(&self, filter: &FilterOutcome, consume: ConsumeOutcome) -> Resolution {
        if filter.is_halted() {
            return Resolution::settle(match self.halt_action {
                HaltAction::Acknowledge => BrokerAction::Acknowledge,
                HaltAction::Requeue => BrokerAction::Requeue,
            });
        }

        match consume {
            // A proceeding chain always runs consume; treat a skip as handled.
            ConsumeOutcome::Skipped | ConsumeOutcome::Succeeded => {
                Resolution::settle(BrokerAction::Acknowledge)
            }
            ConsumeOutcome::Failed(Policy::Ignore) => Resolution::settle(BrokerAction::Acknowledge),
            ConsumeOutcome::Failed(Policy::Requeue) => Resolution::settle(BrokerAction::Requeue),
            ConsumeOutcome::Failed(Policy::Abort) | ConsumeOutcome::Failed(Policy::Unrecognized) => {
                Resolution::fatal()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn halted() -> FilterOutcome {
        FilterOutcome::Halted {
            filter: "f".into(),
        }
    }

    #[test]
    fn halted_acknowledges_by_default() {
        let resolution = OutcomeResolver::default().resolve(&halted(), ConsumeOutcome::Skipped);
        assert_eq!(resolution.action, BrokerAction::Acknowledge);
        assert!(!resolution.terminate);
        assert!(!resolution.fatal);
    }

    #[test]
    fn halted_requeues_when_configured() {
        let resolver = OutcomeResolver::new(HaltAction::Requeue);
        let resolution = resolver.resolve(&halted(), ConsumeOutcome::Skipped);
        assert_eq!(resolution.action, BrokerAction::Requeue);
        assert!(!resolution.fatal);
    }

    #[test]
    fn success_acknowledges() {
        let resolution =
            OutcomeResolver::default().resolve(&FilterOutcome::Proceed, ConsumeOutcome::Succeeded);
        assert_eq!(
            resolution,
            Resolution {
                action: BrokerAction::Acknowledge,
                terminate: false,
                fatal: false
            }
        );
    }

    #[test]
    fn policy_table() {
        let resolver = OutcomeResolver::default();
        let cases = [
            (Policy::Ignore, BrokerAction::Acknowledge, false),
            (Policy::Requeue, BrokerAction::Requeue, false),
            (Policy::Abort, BrokerAction::Requeue, true),
            (Policy::Unrecognized, BrokerAction::Requeue, true),
        ];
        for (policy, action, fatal) in cases {
            let resolution = resolver.resolve(&FilterOutcome::Proceed, ConsumeOutcome::Failed(policy));
            assert_eq!(resolution.action, action, "{policy}");
            assert_eq!(resolution.fatal, fatal, "{policy}");
            assert_eq!(resolution.terminate, fatal, "{policy}");
        }
    }

    #[test]
    fn resolution_is_deterministic() {
        let resolver = OutcomeResolver::default();
        let outcome = ConsumeOutcome::Failed(Policy::Unrecognized);
        let first = resolver.resolve(&FilterOutcome::Proceed, outcome);
        let second = resolver.resolve(&FilterOutcome::Proceed, outcome);
        assert_eq!(first, second);
    }

    #[test]
    fn halt_ignores_consume_outcome() {
        let resolver = OutcomeResolver::default();
        let resolution = resolver.resolve(&halted(), ConsumeOutcome::Failed(Policy::Abort));
        assert!(!resolution.fatal);
    }
}
