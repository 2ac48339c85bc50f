//! Oversubscription resolution.
//!
//! When several bids match one offer in a round the listed price is bid up a
//! geometric number of times and the winner is drawn among the bids that can
//! still afford the result. Drawing `k` and resolving a given `k` are separate
//! steps so the resolution can be exercised with a fixed `k`.

use rand::Rng;
use rand_distr::{Distribution, Geometric};

use crate::error::MarketError;
use crate::market::records::Bid;
use crate::types::Price;

/// `max(1, round(log10(n)))`: bidder count on a log scale.
pub fn rescaled_bidders(n_bids: usize) -> i32 {
    if n_bids == 0 {
        return 1;
    }
    ((n_bids as f64).log10().round() as i32).max(1)
}

/// Success probability of each bid-up trial, clamped from below by `epsilon`.
pub fn success_probability(n_bids: usize, months_under_offer: f64, epsilon: f64) -> f64 {
    let rescaled = rescaled_bidders(n_bids);
    (1.0 - months_under_offer).powi(rescaled - 1).max(epsilon)
}

/// Number of bid-ups for an offer with `n_bids` competing bids.
pub fn draw_bid_ups<R: Rng + ?Sized>(
    rng: &mut R,
    n_bids: usize,
    months_under_offer: f64,
    epsilon: f64,
) -> Result<u64, MarketError> {
    let p = success_probability(n_bids, months_under_offer, epsilon);
    let geometric = Geometric::new(p).map_err(|_| MarketError::InvalidProbability(p))?;
    Ok(geometric.sample(rng))
}

/// Listed price after `k` bid-ups.
pub fn clearing_price(listed_price: Price, bid_up_factor: f64, k: u64) -> Price {
    if k == 0 {
        return listed_price;
    }
    listed_price * bid_up_factor.powf(k as f64)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub winner: Bid,
    /// Price the transaction completes at.
    pub price: Price,
    /// Every other bid, ascending by (price, seq).
    pub losers: Vec<Bid>,
    pub bid_ups: u64,
}

/// Pick a winner among `bids` after `k` bid-ups of `listed_price`.
///
/// Returns `None` only if `bids` is empty.
pub fn resolve_with_bid_ups<R: Rng + ?Sized>(
    rng: &mut R,
    listed_price: Price,
    bid_up_factor: f64,
    k: u64,
    mut bids: Vec<Bid>,
) -> Option<Resolution> {
    if bids.is_empty() {
        return None;
    }
    bids.sort_by(|a, b| a.price.total_cmp(&b.price).then(a.seq.cmp(&b.seq)));

    let target = clearing_price(listed_price, bid_up_factor, k);
    let first_eligible = bids.partition_point(|b| b.price < target);

    let (index, price) = if first_eligible < bids.len() {
        (rng.random_range(first_eligible..bids.len()), target)
    } else {
        // Nobody can pay the bid-up price: the highest bid wins at its own price
        let last = bids.len() - 1;
        (last, bids[last].price)
    };

    let winner = bids.remove(index);
    Some(Resolution {
        winner,
        price,
        losers: bids,
        bid_ups: k,
    })
}

/// Full resolution of one oversubscribed offer.
///
/// With `bid_up_factor == 1.0` no draw is made and the offer clears at its
/// listed price.
pub fn resolve_oversubscription<R: Rng + ?Sized>(
    rng: &mut R,
    listed_price: Price,
    bid_up_factor: f64,
    months_under_offer: f64,
    epsilon: f64,
    bids: Vec<Bid>,
) -> Result<Option<Resolution>, MarketError> {
    let k = if bid_up_factor == 1.0 {
        0
    } else {
        draw_bid_ups(rng, bids.len(), months_under_offer, epsilon)?
    };
    Ok(resolve_with_bid_ups(rng, listed_price, bid_up_factor, k, bids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentId;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use slotmap::SlotMap;

    fn bids(prices: &[f64]) -> Vec<Bid> {
        let mut agents: SlotMap<AgentId, ()> = SlotMap::with_key();
        prices
            .iter()
            .enumerate()
            .map(|(i, &price)| Bid {
                bidder: agents.insert(()),
                price,
                yield_driven: false,
                desired_down_payment: 0.0,
                seq: i as u64,
            })
            .collect()
    }

    #[test]
    fn rescaling_is_logarithmic_with_floor_of_one() {
        assert_eq!(rescaled_bidders(2), 1);
        assert_eq!(rescaled_bidders(3), 1);
        assert_eq!(rescaled_bidders(4), 1);
        assert_eq!(rescaled_bidders(10), 1);
        assert_eq!(rescaled_bidders(40), 2);
        assert_eq!(rescaled_bidders(1000), 3);
    }

    #[test]
    fn few_bidders_never_bid_up() {
        // rescaled n of 1 gives p = 1, so the first trial always succeeds
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            assert_eq!(draw_bid_ups(&mut rng, 3, 7.0 / 30.0, 1e-6).unwrap(), 0);
        }
    }

    #[test]
    fn probability_is_clamped_to_epsilon() {
        let p = success_probability(1_000_000, 1.0, 1e-6);
        assert_eq!(p, 1e-6);
        let mut rng = StdRng::seed_from_u64(7);
        assert!(draw_bid_ups(&mut rng, 1_000_000, 1.0, 1e-6).is_ok());
    }

    #[test]
    fn disabled_bid_up_draws_among_bids_at_listed_price() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let offered = bids(&[180.0, 210.0, 220.0]);
            let res = resolve_oversubscription(&mut rng, 200.0, 1.0, 7.0 / 30.0, 1e-6, offered)
                .unwrap()
                .unwrap();
            assert_eq!(res.price, 200.0);
            assert!(res.winner.price == 210.0 || res.winner.price == 220.0);
            assert_eq!(res.losers.len(), 2);
            assert_eq!(res.losers[0].price, 180.0, "losers stay in ascending order");
        }
    }

    #[test]
    fn bid_up_excludes_bids_below_clearing_price() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let res =
                resolve_with_bid_ups(&mut rng, 200.0, 1.0075, 2, bids(&[202.0, 210.0, 220.0]))
                    .unwrap();
            // 200 * 1.0075^2
            assert!((res.price - 203.01125).abs() < 1e-9);
            assert!(res.winner.price >= res.price);
            assert!(res.losers.iter().any(|b| b.price == 202.0));
        }
    }

    #[test]
    fn highest_bid_wins_at_own_price_when_nobody_can_pay() {
        let mut rng = StdRng::seed_from_u64(1);
        let res =
            resolve_with_bid_ups(&mut rng, 200.0, 1.0075, 10, bids(&[201.0, 203.0])).unwrap();
        assert_eq!(res.winner.price, 203.0);
        assert_eq!(res.price, 203.0);
        assert_eq!(res.losers.len(), 1);
    }

    #[test]
    fn empty_bids_resolve_to_nothing() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(resolve_with_bid_ups(&mut rng, 200.0, 1.0075, 0, Vec::new()).is_none());
    }
}
