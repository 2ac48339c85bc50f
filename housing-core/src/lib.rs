use rand::SeedableRng;
use rand::rngs::StdRng;
use wasm_bindgen::prelude::*;

pub mod agents;
pub mod config;
pub mod error;
pub mod market;
pub mod queue;
pub mod snapshot;
pub mod stats;
pub mod types;
pub mod world;

pub use agents::*;
pub use config::*;
pub use error::*;
pub use market::{Bid, ClearingReport, HousingMarket, Offer, Settlement, Transaction};
pub use queue::{Entry, PriorityQueue2D};
pub use snapshot::*;
pub use stats::*;
pub use types::*;
pub use world::*;

#[cfg(feature = "instrument")]
pub use instrument;

// ============================================================================
// WASM API - Simulation
// ============================================================================

/// A world, the agents trading in it and both markets' statistics.
#[wasm_bindgen]
pub struct Simulation {
    world: World,
    ledger: Ledger,
    sale_stats: MarketStats,
    rental_stats: MarketStats,
    rng: StdRng,
    transactions: Vec<Transaction>,
}

#[wasm_bindgen]
impl Simulation {
    /// Build from a JSON [`SimulationConfig`]; an empty string uses the defaults.
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: &str) -> Result<Simulation, JsError> {
        // Better panic messages in browser console
        console_error_panic_hook::set_once();

        let config = if config_json.trim().is_empty() {
            SimulationConfig::default()
        } else {
            serde_json::from_str(config_json)?
        };
        Ok(Self::from_config(config)?)
    }

    #[wasm_bindgen]
    pub fn add_agent(&mut self, cash: f64) -> u64 {
        self.ledger
            .add_agent(Account::default().with_cash(cash))
            .to_u64()
    }

    #[wasm_bindgen]
    pub fn add_property(&mut self, quality: u32, owner: u64) -> Result<u64, JsError> {
        let owner = self.agent(owner)?;
        let id = self.world.add_property(quality, owner)?;
        if let Some(account) = self.ledger.get_agent_mut(owner) {
            account.owned.insert(id);
        }
        Ok(id.to_u64())
    }

    #[wasm_bindgen]
    pub fn offer_for_sale(&mut self, property: u64, price: f64, is_investment: bool) -> Result<u64, JsError> {
        let id = self
            .world
            .offer_for_sale(PropertyId::from_u64(property), price, is_investment)?;
        Ok(id.to_u64())
    }

    #[wasm_bindgen]
    pub fn offer_for_rent(&mut self, property: u64, rent: f64) -> Result<u64, JsError> {
        let id = self.world.offer_for_rent(PropertyId::from_u64(property), rent)?;
        Ok(id.to_u64())
    }

    #[wasm_bindgen]
    pub fn update_sale_price(&mut self, property: u64, price: f64) -> Result<(), JsError> {
        Ok(self
            .world
            .update_sale_price(PropertyId::from_u64(property), price)?)
    }

    #[wasm_bindgen]
    pub fn update_rent(&mut self, property: u64, rent: f64) -> Result<(), JsError> {
        Ok(self.world.update_rent(PropertyId::from_u64(property), rent)?)
    }

    #[wasm_bindgen]
    pub fn withdraw_sale(&mut self, property: u64) -> Result<(), JsError> {
        self.world.withdraw_sale(PropertyId::from_u64(property))?;
        Ok(())
    }

    #[wasm_bindgen]
    pub fn withdraw_rental(&mut self, property: u64) -> Result<(), JsError> {
        self.world.withdraw_rental(PropertyId::from_u64(property))?;
        Ok(())
    }

    #[wasm_bindgen]
    pub fn bid_for_sale(
        &mut self,
        bidder: u64,
        price: f64,
        yield_driven: bool,
        desired_down_payment: f64,
    ) -> Result<(), JsError> {
        let bidder = self.agent(bidder)?;
        Ok(self
            .world
            .bid_for_sale(bidder, price, yield_driven, desired_down_payment)?)
    }

    #[wasm_bindgen]
    pub fn bid_for_rent(&mut self, bidder: u64, price: f64) -> Result<(), JsError> {
        let bidder = self.agent(bidder)?;
        Ok(self.world.bid_for_rent(bidder, price)?)
    }

    #[wasm_bindgen]
    pub fn end_tenancy(&mut self, property: u64) -> Result<(), JsError> {
        self.world
            .end_tenancy(PropertyId::from_u64(property), &mut self.ledger)?;
        Ok(())
    }

    /// Clear both markets and advance the clock by a month.
    #[wasm_bindgen]
    pub fn step_month(&mut self) -> Result<MonthSummary, JsError> {
        Ok(self.step()?)
    }

    #[wasm_bindgen]
    pub fn get_month(&self) -> u32 {
        self.world.month()
    }

    #[wasm_bindgen]
    pub fn house_price_appreciation(&self, years: u32) -> Option<f64> {
        self.sale_stats.house_price_appreciation(years)
    }

    #[wasm_bindgen]
    pub fn get_snapshot(&self) -> WorldSnapshot {
        WorldSnapshot::capture(&self.world, &self.sale_stats, &self.rental_stats)
    }

    /// Every transaction so far, oldest first.
    #[wasm_bindgen]
    pub fn get_transactions(&self) -> Result<JsValue, JsError> {
        let rows: Vec<TransactionSnapshot> = self.transactions.iter().map(Into::into).collect();
        serde_wasm_bindgen::to_value(&rows).map_err(|e| JsError::new(&e.to_string()))
    }
}

impl Simulation {
    pub fn from_config(config: SimulationConfig) -> Result<Self, MarketError> {
        config.validate()?;
        Ok(Self {
            world: World::new(config.market.clone())?,
            ledger: Ledger::new(),
            sale_stats: MarketStats::new(config.sale_reference_prices, config.market.stats.clone())?,
            rental_stats: MarketStats::new(config.rental_reference_prices, config.market.stats)?,
            rng: StdRng::seed_from_u64(config.seed),
            transactions: Vec::new(),
        })
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    pub fn sale_stats(&self) -> &MarketStats {
        &self.sale_stats
    }

    pub fn rental_stats(&self) -> &MarketStats {
        &self.rental_stats
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    fn agent(&self, id: u64) -> Result<AgentId, MarketError> {
        let agent = AgentId::from_u64(id);
        self.ledger
            .get_agent(agent)
            .map(|_| agent)
            .ok_or(MarketError::UnknownAgent(agent))
    }

    /// One simulated month: close last month's statistics, refresh sale
    /// yields from observed rents, clear the sale then the rental market,
    /// and count tenancies down.
    pub fn step(&mut self) -> Result<MonthSummary, MarketError> {
        self.sale_stats.record_market_stats();
        self.rental_stats.record_market_stats();

        let n_quality = self.world.sale_market().config().n_quality;
        let annual_rents = (0..n_quality)
            .map(|q| 12.0 * self.rental_stats.average_sale_price(q))
            .collect();
        self.world.set_expected_rents(annual_rents)?;

        let sales = self
            .world
            .clear_sale_market(&mut self.rng, &mut self.ledger, &mut self.sale_stats)?;
        let lets = self
            .world
            .clear_rental_market(&mut self.rng, &mut self.ledger, &mut self.rental_stats)?;
        let ended = self.world.advance_tenancies(&mut self.ledger)?;

        let summary = MonthSummary {
            month: self.world.month(),
            sales: sales.transactions.len() as u32,
            lets: lets.transactions.len() as u32,
            sale_rounds: sales.rounds,
            rental_rounds: lets.rounds,
            discarded_bids: (sales.discarded_bids + lets.discarded_bids) as u32,
            tenancies_ended: ended.len() as u32,
            house_price_index: self.sale_stats.house_price_index(),
        };
        self.transactions.extend(sales.transactions);
        self.transactions.extend(lets.transactions);
        self.world.advance_month();
        Ok(summary)
    }
}
