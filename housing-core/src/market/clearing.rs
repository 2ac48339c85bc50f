use std::collections::{HashMap, HashSet};

use rand::Rng;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

#[cfg(feature = "instrument")]
use crate::market::bid_up::rescaled_bidders;
#[cfg(feature = "instrument")]
use crate::types::KeyToU64;

use crate::config::MarketConfig;
use crate::error::{MarketError, QueueError};
use crate::market::bid_up::{Resolution, resolve_oversubscription};
use crate::market::records::{Bid, Offer};
use crate::queue::{Entry, PriorityQueue2D};
use crate::types::{AgentId, MarketKind, Month, OfferId, Price, PropertyId, Quality, is_valid_price};

// ============================================================================
// Settlement - side effects of a completed match, supplied by the caller
// ============================================================================

pub trait Settlement {
    /// Current owner of `property`. Bids are never matched to offers of
    /// properties their bidder owns.
    fn owner_of(&self, property: PropertyId) -> Option<AgentId>;

    /// Apply a completed match. `offer` is already off the market and carries
    /// the final transaction price.
    fn complete(&mut self, bid: &Bid, offer: &Offer) -> Result<(), MarketError>;
}

/// One completed match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub market: MarketKind,
    pub month: Month,
    pub round: u32,
    pub offer: OfferId,
    pub property: PropertyId,
    pub seller: Option<AgentId>,
    pub buyer: AgentId,
    pub quality: Quality,
    pub listed_price: Price,
    pub price: Price,
    pub n_bids: usize,
    pub bid_ups: u64,
    pub yield_driven: bool,
    pub desired_down_payment: Price,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClearingReport {
    pub rounds: u32,
    pub transactions: Vec<Transaction>,
    /// Bids that left the month without a house.
    pub discarded_bids: usize,
}

// ============================================================================
// HousingMarket
// ============================================================================

/// Offer pool, bid pool and the monthly clearing loop.
///
/// The sale market indexes every offer by (price, quality) and by
/// (price, yield); the rental market only by (price, quality).
#[derive(Debug, Clone)]
pub struct HousingMarket {
    kind: MarketKind,
    config: MarketConfig,
    month: Month,
    offers: SlotMap<OfferId, Offer>,
    listings: HashMap<PropertyId, OfferId>,
    by_quality: PriorityQueue2D<OfferId>,
    by_yield: Option<PriorityQueue2D<OfferId>>,
    bids: Vec<Bid>,
    /// Expected annual rent per quality band, used for sale yields.
    expected_rents: Vec<Price>,
    next_seq: u64,
}

impl HousingMarket {
    pub fn new(kind: MarketKind, config: MarketConfig) -> Result<Self, MarketError> {
        config.validate()?;
        let by_yield = match kind {
            MarketKind::Sale => Some(PriorityQueue2D::new()),
            MarketKind::Rental => None,
        };
        Ok(Self {
            kind,
            expected_rents: vec![0.0; config.n_quality as usize],
            config,
            month: 0,
            offers: SlotMap::with_key(),
            listings: HashMap::new(),
            by_quality: PriorityQueue2D::new(),
            by_yield,
            bids: Vec::new(),
            next_seq: 0,
        })
    }

    pub fn sale(config: MarketConfig) -> Result<Self, MarketError> {
        Self::new(MarketKind::Sale, config)
    }

    pub fn rental(config: MarketConfig) -> Result<Self, MarketError> {
        Self::new(MarketKind::Rental, config)
    }

    pub fn kind(&self) -> MarketKind {
        self.kind
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn month(&self) -> Month {
        self.month
    }

    /// Market clock used for listing dates and transaction records.
    pub fn set_month(&mut self, month: Month) {
        self.month = month;
    }

    pub fn get_offer(&self, id: OfferId) -> Option<&Offer> {
        self.offers.get(id)
    }

    /// Active offers in arena order.
    pub fn offers(&self) -> impl Iterator<Item = (OfferId, &Offer)> + '_ {
        self.offers.iter()
    }

    pub fn offer_count(&self) -> usize {
        self.offers.len()
    }

    /// Active listing of `property` on this market.
    pub fn listing(&self, property: PropertyId) -> Option<OfferId> {
        self.listings.get(&property).copied()
    }

    pub fn pending_bids(&self) -> &[Bid] {
        &self.bids
    }

    pub fn quality_queue(&self) -> &PriorityQueue2D<OfferId> {
        &self.by_quality
    }

    pub fn yield_queue(&self) -> Option<&PriorityQueue2D<OfferId>> {
        self.by_yield.as_ref()
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn yield_of(&self, quality: Quality, price: Price) -> f64 {
        if self.kind == MarketKind::Rental {
            return 0.0;
        }
        let rent = self.expected_rents.get(quality as usize).copied().unwrap_or(0.0);
        if rent <= 0.0 {
            return 0.0;
        }
        // Tiny prices overflow to infinity; queue keys must stay finite
        let y = rent / price;
        if y.is_finite() { y } else { f64::MAX }
    }

    // === OFFERS ===

    /// List `property` at `price`. The listing month is the market clock.
    pub fn offer(
        &mut self,
        property: PropertyId,
        quality: Quality,
        price: Price,
        is_investment: bool,
    ) -> Result<OfferId, MarketError> {
        if !is_valid_price(price) {
            return Err(MarketError::InvalidPrice(price));
        }
        if quality >= self.config.n_quality {
            return Err(MarketError::InvalidQuality {
                quality,
                n_quality: self.config.n_quality,
            });
        }
        if self.listings.contains_key(&property) {
            return Err(MarketError::AlreadyListed(property));
        }

        let seq = self.take_seq();
        let yield_estimate = self.yield_of(quality, price);
        let id = self.offers.insert(Offer {
            property,
            quality,
            price,
            initial_price: price,
            initial_listing_month: self.month,
            yield_estimate,
            is_investment,
            seq,
            matched_bids: Vec::new(),
        });

        if let Err(e) = self.index_offer(id, price, quality, yield_estimate, seq) {
            let _ = self.by_quality.remove(id);
            self.offers.remove(id);
            return Err(e.into());
        }
        self.listings.insert(property, id);
        Ok(id)
    }

    /// Insert into both queues; the caller rolls back on error.
    fn index_offer(
        &mut self,
        id: OfferId,
        price: Price,
        quality: Quality,
        yield_estimate: f64,
        seq: u64,
    ) -> Result<(), QueueError> {
        self.by_quality
            .insert(Entry::new(id, price, quality as f64, seq))?;
        if let Some(by_yield) = self.by_yield.as_mut() {
            by_yield.insert(Entry::new(id, price, yield_estimate, seq))?;
        }
        Ok(())
    }

    /// Re-price an offer in every structure that indexes it.
    pub fn update_offer(&mut self, id: OfferId, new_price: Price) -> Result<(), MarketError> {
        if !is_valid_price(new_price) {
            return Err(MarketError::InvalidPrice(new_price));
        }
        let quality = self
            .offers
            .get(id)
            .ok_or(MarketError::UnknownOffer(id))?
            .quality;
        let yield_estimate = self.yield_of(quality, new_price);

        self.by_quality.update(id, new_price, quality as f64)?;
        if let Some(by_yield) = self.by_yield.as_mut() {
            by_yield.update(id, new_price, yield_estimate)?;
        }
        if let Some(offer) = self.offers.get_mut(id) {
            offer.price = new_price;
            offer.yield_estimate = yield_estimate;
        }
        Ok(())
    }

    /// Withdraw an offer, returning its record.
    pub fn remove_offer(&mut self, id: OfferId) -> Result<Offer, MarketError> {
        if !self.offers.contains_key(id) {
            return Err(MarketError::UnknownOffer(id));
        }
        self.by_quality.remove(id)?;
        if let Some(by_yield) = self.by_yield.as_mut() {
            by_yield.remove(id)?;
        }
        let offer = self.offers.remove(id).ok_or(MarketError::UnknownOffer(id))?;
        self.listings.remove(&offer.property);
        Ok(offer)
    }

    /// Replace the expected rent table and re-key every sale offer's yield.
    pub fn set_expected_rents(&mut self, rents: Vec<Price>) -> Result<(), MarketError> {
        if let Some(bad) = rents.iter().copied().find(|r| !is_valid_price(*r)) {
            return Err(MarketError::InvalidPrice(bad));
        }
        self.expected_rents = rents;
        if self.by_yield.is_none() {
            return Ok(());
        }

        let rekeyed: Vec<(OfferId, Price, f64)> = self
            .offers
            .iter()
            .map(|(id, o)| (id, o.price, self.yield_of(o.quality, o.price)))
            .collect();
        for (id, price, yield_estimate) in rekeyed {
            if let Some(by_yield) = self.by_yield.as_mut() {
                by_yield.update(id, price, yield_estimate)?;
            }
            if let Some(offer) = self.offers.get_mut(id) {
                offer.yield_estimate = yield_estimate;
            }
        }
        Ok(())
    }

    // === BIDS ===

    pub fn bid(
        &mut self,
        bidder: AgentId,
        price: Price,
        yield_driven: bool,
        desired_down_payment: Price,
    ) -> Result<(), MarketError> {
        if !is_valid_price(price) {
            return Err(MarketError::InvalidPrice(price));
        }
        if yield_driven && self.by_yield.is_none() {
            return Err(MarketError::YieldBidOnRentalMarket);
        }
        let seq = self.take_seq();
        self.bids.push(Bid {
            bidder,
            price,
            yield_driven,
            desired_down_payment,
            seq,
        });
        Ok(())
    }

    fn queue_for(&mut self, yield_driven: bool) -> Result<&mut PriorityQueue2D<OfferId>, MarketError> {
        if yield_driven {
            self.by_yield
                .as_mut()
                .ok_or(MarketError::YieldBidOnRentalMarket)
        } else {
            Ok(&mut self.by_quality)
        }
    }

    /// Best offer for `bid`, ignoring ownership.
    pub fn best_offer(&self, bid: &Bid) -> Result<Option<OfferId>, MarketError> {
        let queue = if bid.yield_driven {
            self.by_yield
                .as_ref()
                .ok_or(MarketError::YieldBidOnRentalMarket)?
        } else {
            &self.by_quality
        };
        if queue.is_empty() {
            return Ok(None);
        }
        Ok(queue.peek(bid.price)?)
    }

    /// Best offer for `bid` whose property the bidder does not own.
    ///
    /// Self-owned candidates are lifted out of the queue while searching and
    /// put back with their original sequence ids.
    fn match_for<S: Settlement + ?Sized>(
        &mut self,
        bid: &Bid,
        ctx: &S,
    ) -> Result<Option<OfferId>, MarketError> {
        let mut skipped = Vec::new();
        let found = loop {
            let queue = self.queue_for(bid.yield_driven)?;
            if queue.is_empty() {
                break None;
            }
            let Some(id) = queue.peek(bid.price)? else {
                break None;
            };
            let property = self
                .offers
                .get(id)
                .ok_or(MarketError::UnknownOffer(id))?
                .property;
            if ctx.owner_of(property) != Some(bid.bidder) {
                break Some(id);
            }
            let entry = self.queue_for(bid.yield_driven)?.remove(id)?;
            skipped.push(entry);
        };

        let queue = self.queue_for(bid.yield_driven)?;
        for entry in skipped {
            queue.insert(entry)?;
        }
        Ok(found)
    }

    // === CLEARING ===

    /// Match pending bids against offers until either pool runs dry.
    ///
    /// Each round every pending bid is matched to its best offer, then the
    /// matched offers are resolved in ascending quality order. Losing bids of
    /// oversubscribed offers go back into the pool for the next round; bids
    /// that found no offer are dropped. Nothing survives the call: on error
    /// every pending and matched bid is dropped too, and an offer whose
    /// settlement failed stays withdrawn.
    pub fn clear_market<R, S>(&mut self, rng: &mut R, ctx: &mut S) -> Result<ClearingReport, MarketError>
    where
        R: Rng + ?Sized,
        S: Settlement + ?Sized,
    {
        let mut report = ClearingReport::default();
        let outcome = self.run_rounds(rng, ctx, &mut report);
        report.discarded_bids += self.discard_bids();
        outcome.map(|()| report)
    }

    /// Drop every pending and matched bid, returning how many there were.
    fn discard_bids(&mut self) -> usize {
        let mut n = self.bids.len();
        self.bids.clear();
        for offer in self.offers.values_mut() {
            n += offer.matched_bids.len();
            offer.matched_bids.clear();
        }
        n
    }

    fn run_rounds<R, S>(
        &mut self,
        rng: &mut R,
        ctx: &mut S,
        report: &mut ClearingReport,
    ) -> Result<(), MarketError>
    where
        R: Rng + ?Sized,
        S: Settlement + ?Sized,
    {
        while !self.bids.is_empty() && !self.offers.is_empty() {
            if self
                .config
                .max_rounds
                .is_some_and(|max| report.rounds >= max)
            {
                break;
            }
            report.rounds += 1;
            let round = report.rounds;

            // 1. Match every pending bid to its best offer
            let pending = std::mem::take(&mut self.bids);
            let n_pending = pending.len();
            let mut matched = HashSet::new();
            for bid in pending {
                match self.match_for(&bid, &*ctx)? {
                    Some(id) => {
                        self.offers
                            .get_mut(id)
                            .ok_or(MarketError::UnknownOffer(id))?
                            .matched_bids
                            .push(bid);
                        matched.insert(id);
                    }
                    None => report.discarded_bids += 1,
                }
            }

            #[cfg(feature = "instrument")]
            tracing::info!(
                target: "clearing",
                month = self.month,
                market = self.kind.as_str(),
                round = round,
                pending_bids = n_pending as u64,
                offers = self.offers.len() as u64,
                matched_offers = matched.len() as u64,
            );
            let _ = n_pending;

            // 2. Resolve every matched offer, lowest quality first
            let order: Vec<OfferId> = self
                .by_quality
                .iter()
                .map(|e| e.handle)
                .filter(|id| matched.contains(id))
                .collect();
            for id in order {
                let mut offer = self.remove_offer(id)?;
                let mut bids = std::mem::take(&mut offer.matched_bids);
                let n_bids = bids.len();
                let listed_price = offer.price;

                let resolution = if n_bids == 1 {
                    bids.pop().map(|winner| Resolution {
                        winner,
                        price: listed_price,
                        losers: Vec::new(),
                        bid_ups: 0,
                    })
                } else {
                    let resolution = resolve_oversubscription(
                        rng,
                        listed_price,
                        self.config.bid_up_factor,
                        self.config.months_under_offer,
                        self.config.epsilon,
                        bids,
                    )?;

                    #[cfg(feature = "instrument")]
                    {
                        if let Some(res) = &resolution {
                            tracing::info!(
                                target: "bid_up",
                                month = self.month,
                                market = self.kind.as_str(),
                                offer_id = id.to_u64(),
                                n_bids = n_bids as u64,
                                rescaled_n = rescaled_bidders(n_bids),
                                k = res.bid_ups,
                                listed_price = listed_price,
                                clearing_price = res.price,
                            );
                        }
                    }
                    resolution
                };
                let Some(Resolution {
                    winner,
                    price,
                    losers,
                    bid_ups,
                }) = resolution
                else {
                    continue;
                };

                offer.price = price;
                let seller = ctx.owner_of(offer.property);
                ctx.complete(&winner, &offer)?;

                #[cfg(feature = "instrument")]
                tracing::info!(
                    target: "transaction",
                    month = self.month,
                    market = self.kind.as_str(),
                    round = round,
                    offer_id = id.to_u64(),
                    property_id = offer.property.to_u64(),
                    buyer_id = winner.bidder.to_u64(),
                    quality = offer.quality,
                    listed_price = listed_price,
                    price = price,
                    n_bids = n_bids as u64,
                    bid_ups = bid_ups,
                    yield_driven = winner.yield_driven,
                );

                report.transactions.push(Transaction {
                    market: self.kind,
                    month: self.month,
                    round,
                    offer: id,
                    property: offer.property,
                    seller,
                    buyer: winner.bidder,
                    quality: offer.quality,
                    listed_price,
                    price,
                    n_bids,
                    bid_ups,
                    yield_driven: winner.yield_driven,
                    desired_down_payment: winner.desired_down_payment,
                });
                self.bids.extend(losers);
            }
        }

        Ok(())
    }
}
