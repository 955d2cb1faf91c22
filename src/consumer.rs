//! The consumer contract implemented by business logic.

use async_trait::async_trait;

use crate::envelope::{DeliveryInfo, Envelope};
use crate::filter::FilterChain;

/// How a consumer wants a failed delivery resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    /// Drop the delivery and keep going.
    Ignore,
    /// Put the delivery back and keep going.
    Requeue,
    /// Put the delivery back and stop the loop as failed.
    Abort,
    /// Anything the resolver does not know. Handled exactly like `Abort`.
    Unrecognized,
}

impl Policy {
    /// Map a policy name to a policy.
    ///
    /// `exit` is accepted as an alias for `abort`. Unknown names map to
    /// [`Policy::Unrecognized`] rather than failing.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "ignore" => Self::Ignore,
            "requeue" => Self::Requeue,
            "abort" | "exit" => Self::Abort,
            _ => Self::Unrecognized,
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Requeue => "requeue",
            Self::Abort => "abort",
            Self::Unrecognized => "unrecognized",
        }
    }

    /// Whether resolving with this policy stops the loop as failed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Abort | Self::Unrecognized)
    }
}

impl From<&str> for Policy {
    fn from(name: &str) -> Self {
        Self::from_name(name)
    }
}

impl std::fmt::Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-cycle handle that filters and consumers use to ask the loop to stop.
///
/// Asking to stop is not an error: the current delivery is still resolved
/// normally and the loop then ends with a successful result.
#[derive(Debug, Default)]
pub struct LoopControl {
    exit_requested: bool,
}

impl LoopControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the loop stop after this cycle.
    pub fn exit_loop(&mut self) {
        self.exit_requested = true;
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }
}

/// Business logic bound to one queue.
///
/// The loop calls [`filters`](Consumer::filters) once at construction, then
/// for each delivery runs the chain, calls [`consume`](Consumer::consume) if
/// every filter passed, and asks [`on_error`](Consumer::on_error) for a
/// [`Policy`] when `consume` fails. The loop keeps no consumer state between
/// deliveries.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Filters run before every `consume`, in order.
    fn filters(&self) -> FilterChain<Self>
    where
        Self: Sized,
    {
        FilterChain::new()
    }

    /// Handle one delivery.
    async fn consume(
        &self,
        envelope: &Envelope,
        info: &DeliveryInfo,
        control: &mut LoopControl,
    ) -> anyhow::Result<()>;

    /// Decide how a failed `consume` is resolved.
    fn on_error(&self, error: &anyhow::Error, envelope: &Envelope, info: &DeliveryInfo) -> Policy;
}
