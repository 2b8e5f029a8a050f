//! Hierarchical, fair token-bucket rate limiting.
//!
//! A [`RateLimitManager`] is the root of a tree whose interior nodes are
//! [`RateLimiter`]s and whose leaves are [`Bucket`]s. On a fixed cadence the
//! manager refills the tree: each limiter divides its byte budget fairly by
//! weight over its children, tokens no child can hold are redistributed to
//! subtrees with spare demand, and budget granted eagerly to late joiners
//! is repaid on later ticks. Inbound and outbound budgets are independent.
//!
//! [`RateLimitedLayer`] puts the machinery on the socket path: a layer that
//! is itself a bucket, truncating reads and writes to the available budget
//! and posting synthetic readiness events when budget returns.

mod layer;
mod limiter;

pub use layer::{CompoundRateLimitedLayer, RateLimitedLayer};
pub use limiter::{Bucket, RateLimitManager, RateLimiter};

/// Disables throttling in a direction when used as a limit.
pub const UNLIMITED: usize = usize::MAX;

/// Transfer direction, regulated independently by the limiter tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub(crate) const ALL: [Direction; 2] = [Direction::Inbound, Direction::Outbound];

    pub(crate) fn idx(self) -> usize {
        match self {
            Direction::Inbound => 0,
            Direction::Outbound => 1,
        }
    }
}
