//! Pre-consume filter chain.
//!
//! Filters run in registration order before a consumer sees a delivery.
//! Each one returns `true` to pass or `false` to halt; a halt skips
//! `consume` for that delivery and is not treated as a failure. Filters may
//! also request loop termination through [`LoopControl`] regardless of
//! what they return.

use regex::Regex;
use tracing::debug;

use crate::consumer::LoopControl;
use crate::envelope::{DeliveryInfo, Envelope};

/// Filter function signature: the consumer, the delivery, and the cycle's control handle.
pub type FilterFn<C> =
    dyn Fn(&C, &Envelope, &DeliveryInfo, &mut LoopControl) -> bool + Send + Sync;

/// Result of running the chain over one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Every filter passed.
    Proceed,
    /// The named filter returned `false`.
    Halted { filter: String },
}

impl FilterOutcome {
    pub fn is_halted(&self) -> bool {
        matches!(self, Self::Halted { .. })
    }
}

/// A filter with the name it was registered under.
pub struct NamedFilter<C> {
    pub name: String,
    filter: Box<FilterFn<C>>,
}

/// Ordered list of filters for consumer type `C`.
pub struct FilterChain<C> {
    filters: Vec<NamedFilter<C>>,
}

impl<C> FilterChain<C> {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    /// Append a filter.
    pub fn before<F>(mut self, name: impl Into<String>, filter: F) -> Self
    where
        F: Fn(&C, &Envelope, &DeliveryInfo, &mut LoopControl) -> bool + Send + Sync + 'static,
    {
        self.push(name, filter);
        self
    }

    /// Append a filter in place.
    pub fn push<F>(&mut self, name: impl Into<String>, filter: F)
    where
        F: Fn(&C, &Envelope, &DeliveryInfo, &mut LoopControl) -> bool + Send + Sync + 'static,
    {
        self.filters.push(NamedFilter {
            name: name.into(),
            filter: Box::new(filter),
        });
    }

    /// Append a filter that halts deliveries whose routing key does not
    /// match the AMQP topic `pattern`.
    pub fn add_routing_key(&mut self, pattern: &str) -> Result<(), regex::Error> {
        let regex = topic_regex(pattern)?;
        self.push(
            format!("routing_key({pattern})"),
            move |_: &C, envelope: &Envelope, _: &DeliveryInfo, _: &mut LoopControl| {
                regex.is_match(envelope.routing_key())
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Filter names in run order.
    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name.as_str()).collect()
    }

    /// Run the chain, stopping at the first filter that returns `false`.
    pub fn run(
        &self,
        consumer: &C,
        envelope: &Envelope,
        info: &DeliveryInfo,
        control: &mut LoopControl,
    ) -> FilterOutcome {
        for named in &self.filters {
            if !(named.filter)(consumer, envelope, info, control) {
                debug!(
                    filter = %named.name,
                    delivery_tag = info.delivery_tag,
                    exit_requested = control.exit_requested(),
                    "Filter halted delivery"
                );
                return FilterOutcome::Halted {
                    filter: named.name.clone(),
                };
            }
        }
        FilterOutcome::Proceed
    }
}

impl<C> Default for FilterChain<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for FilterChain<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.names())
            .finish()
    }
}

/// Compile an AMQP topic pattern (`*` = one word, `#` = zero or more words).
///
/// Words may be empty, as on the broker: `a.*.b` matches `a..b`.
pub fn topic_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut words: Vec<&str> = pattern.split('.').collect();
    words.dedup_by(|a, b| *a == "#" && *b == "#");
    if words == ["#"] {
        return Regex::new("^.*$");
    }

    let mut re = String::from("^");
    for (i, word) in words.iter().enumerate() {
        let leading_hash = i == 1 && words[0] == "#";
        let needs_dot = i > 0 && !leading_hash;
        match *word {
            "#" if i == 0 => re.push_str(r"(?:[^.]*\.)*"),
            "#" => re.push_str(r"(?:\.[^.]*)*"),
            "*" => {
                if needs_dot {
                    re.push_str(r"\.");
                }
                re.push_str(r"[^.]*");
            }
            literal => {
                if needs_dot {
                    re.push_str(r"\.");
                }
                re.push_str(&regex::escape(literal));
            }
        }
    }
    re.push('$');
    Regex::new(&re)
}
