pub mod bid_up;
pub mod clearing;
pub mod records;

pub use bid_up::{Resolution, draw_bid_ups, rescaled_bidders, resolve_oversubscription, resolve_with_bid_ups};
pub use clearing::{ClearingReport, HousingMarket, Settlement, Transaction};
pub use records::{Bid, Offer};
