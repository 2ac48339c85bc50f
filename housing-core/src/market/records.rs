use serde::{Deserialize, Serialize};

use crate::types::{AgentId, Month, Price, PropertyId, Quality};

// === OFFERS & BIDS ===

/// A property listed on the sale or rental market.
///
/// The listing price only changes through the owning market, which re-indexes
/// the offer in its priority queues on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub property: PropertyId,
    pub quality: Quality,
    pub(crate) price: Price,
    pub initial_price: Price,
    pub initial_listing_month: Month,
    /// Expected annual rent over price. Zero on the rental market.
    pub(crate) yield_estimate: f64,
    /// Listed by a buy-to-let investor rather than an owner-occupier.
    pub is_investment: bool,
    pub(crate) seq: u64,
    #[serde(skip)]
    pub(crate) matched_bids: Vec<Bid>,
}

impl Offer {
    pub fn price(&self) -> Price {
        self.price
    }

    pub fn yield_estimate(&self) -> f64 {
        self.yield_estimate
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Bids matched to this offer in the current round.
    pub fn matched_bids(&self) -> &[Bid] {
        &self.matched_bids
    }

    pub fn months_on_market(&self, now: Month) -> Month {
        now.saturating_sub(self.initial_listing_month)
    }
}

/// A buyer's or tenant's maximum willingness to pay, valid for one month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub bidder: AgentId,
    pub price: Price,
    /// Buy-to-let investor bid: matched on yield instead of quality.
    pub yield_driven: bool,
    pub desired_down_payment: Price,
    pub(crate) seq: u64,
}

impl Bid {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}
