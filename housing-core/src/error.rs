use thiserror::Error;

use crate::types::{AgentId, OfferId, Price, PropertyId, Quality};

/// Misuse of a [`PriorityQueue2D`](crate::queue::PriorityQueue2D).
///
/// Every variant is a programming error: the queue state is left untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueueError {
    #[error("element is not a member of the queue")]
    NotMember,
    #[error("element is already a member of the queue")]
    AlreadyPresent,
    #[error("invalid price {0}: must be finite and non-negative")]
    InvalidPrice(Price),
    #[error("invalid secondary key {0}: must be finite")]
    InvalidKey(f64),
    #[error("ceiling query against an empty queue")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MarketError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("unknown offer {0:?}")]
    UnknownOffer(OfferId),
    #[error("unknown property {0:?}")]
    UnknownProperty(PropertyId),
    #[error("unknown agent {0:?}")]
    UnknownAgent(AgentId),
    #[error("property {0:?} already has an active listing on this market")]
    AlreadyListed(PropertyId),
    #[error("property {0:?} has no active listing on this market")]
    NotListed(PropertyId),
    #[error("property {0:?} has no tenancy")]
    NoTenancy(PropertyId),
    #[error("property {0:?} is already let")]
    Occupied(PropertyId),
    #[error("invalid price {0}: must be finite and non-negative")]
    InvalidPrice(Price),
    #[error("quality band {quality} out of range (n_quality = {n_quality})")]
    InvalidQuality { quality: Quality, n_quality: u32 },
    #[error("yield-driven bids are not accepted on the rental market")]
    YieldBidOnRentalMarket,
    #[error("invalid success probability {0} for the bid-up draw")]
    InvalidProbability(f64),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
