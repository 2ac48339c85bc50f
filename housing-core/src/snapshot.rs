use serde::{Deserialize, Serialize};
use tsify_next::Tsify;

use crate::market::{HousingMarket, Transaction};
use crate::stats::MarketStats;
use crate::types::{KeyToU64, MarketKind, Month, Price, Quality};
use crate::world::World;

// ============================================================================
// Serializable snapshots for JS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Tsify)]
#[tsify(into_wasm_abi)]
pub struct WorldSnapshot {
    pub month: Month,
    pub properties: Vec<PropertySnapshot>,
    pub sale: MarketSnapshot,
    pub rental: MarketSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, Tsify)]
#[tsify(into_wasm_abi)]
pub struct PropertySnapshot {
    pub id: u64,
    pub quality: Quality,
    pub owner: u64,
    pub tenant: Option<u64>,
    pub rent: Option<Price>,
    pub for_sale: bool,
    pub for_rent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Tsify)]
#[tsify(into_wasm_abi)]
pub struct MarketSnapshot {
    pub kind: MarketKind,
    pub offers: Vec<OfferSnapshot>,
    pub house_price_index: f64,
    pub average_days_on_market: f64,
    pub average_prices: Vec<Price>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Tsify)]
#[tsify(into_wasm_abi)]
pub struct OfferSnapshot {
    pub id: u64,
    pub property: u64,
    pub quality: Quality,
    pub price: Price,
    pub initial_price: Price,
    pub months_on_market: Month,
    pub yield_estimate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Tsify)]
#[tsify(into_wasm_abi)]
pub struct TransactionSnapshot {
    pub market: MarketKind,
    pub month: Month,
    pub round: u32,
    pub property: u64,
    pub seller: Option<u64>,
    pub buyer: u64,
    pub quality: Quality,
    pub listed_price: Price,
    pub price: Price,
    pub n_bids: u32,
    pub bid_ups: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Tsify)]
#[tsify(into_wasm_abi)]
pub struct MonthSummary {
    pub month: Month,
    pub sales: u32,
    pub lets: u32,
    pub sale_rounds: u32,
    pub rental_rounds: u32,
    pub discarded_bids: u32,
    pub tenancies_ended: u32,
    pub house_price_index: f64,
}

impl From<&Transaction> for TransactionSnapshot {
    fn from(t: &Transaction) -> Self {
        Self {
            market: t.market,
            month: t.month,
            round: t.round,
            property: t.property.to_u64(),
            seller: t.seller.map(|s| s.to_u64()),
            buyer: t.buyer.to_u64(),
            quality: t.quality,
            listed_price: t.listed_price,
            price: t.price,
            n_bids: t.n_bids as u32,
            bid_ups: t.bid_ups.min(u32::MAX as u64) as u32,
        }
    }
}

impl MarketSnapshot {
    pub fn capture(market: &HousingMarket, stats: &MarketStats) -> Self {
        Self {
            kind: market.kind(),
            offers: market
                .offers()
                .map(|(id, o)| OfferSnapshot {
                    id: id.to_u64(),
                    property: o.property.to_u64(),
                    quality: o.quality,
                    price: o.price(),
                    initial_price: o.initial_price,
                    months_on_market: o.months_on_market(market.month()),
                    yield_estimate: o.yield_estimate(),
                })
                .collect(),
            house_price_index: stats.house_price_index(),
            average_days_on_market: stats.average_days_on_market(),
            average_prices: stats.average_sale_prices().to_vec(),
        }
    }
}

impl WorldSnapshot {
    pub fn capture(world: &World, sale_stats: &MarketStats, rental_stats: &MarketStats) -> Self {
        Self {
            month: world.month(),
            properties: world
                .properties()
                .map(|(id, p)| PropertySnapshot {
                    id: id.to_u64(),
                    quality: p.quality,
                    owner: p.owner.to_u64(),
                    tenant: p.tenancy.as_ref().map(|a| a.tenant.to_u64()),
                    rent: p.tenancy.as_ref().map(|a| a.monthly_rent),
                    for_sale: p.sale_offer.is_some(),
                    for_rent: p.rental_offer.is_some(),
                })
                .collect(),
            sale: MarketSnapshot::capture(world.sale_market(), sale_stats),
            rental: MarketSnapshot::capture(world.rental_market(), rental_stats),
        }
    }
}
