use serde::{Deserialize, Serialize};

use crate::error::MarketError;

/// Parameters of the clearing protocol shared by the sale and rental markets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Smallest proportional price increase that can cause a gazump. 1.0 disables bid-ups.
    pub bid_up_factor: f64,
    /// Time a house remains under offer, as a fraction of a month.
    pub months_under_offer: f64,
    /// Floor for the geometric success probability.
    pub epsilon: f64,
    /// Number of quality bands.
    pub n_quality: u32,
    /// Cap on matching rounds per month. `None` runs until bids or offers run out.
    pub max_rounds: Option<u32>,
    /// Average tenancy length handed to tenants when they agree a let.
    pub tenancy_length_months: u32,
    pub stats: StatsConfig,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            bid_up_factor: 1.0075,
            months_under_offer: 7.0 / 30.0,
            epsilon: 1e-6,
            n_quality: 48,
            max_rounds: None,
            tenancy_length_months: 18,
            stats: StatsConfig::default(),
        }
    }
}

impl MarketConfig {
    pub fn validate(&self) -> Result<(), MarketError> {
        if !self.bid_up_factor.is_finite() || self.bid_up_factor < 1.0 {
            return Err(MarketError::InvalidConfig(format!(
                "bid_up_factor must be finite and >= 1, got {}",
                self.bid_up_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.months_under_offer) {
            return Err(MarketError::InvalidConfig(format!(
                "months_under_offer must lie in [0, 1], got {}",
                self.months_under_offer
            )));
        }
        if !(self.epsilon > 0.0 && self.epsilon <= 1.0) {
            return Err(MarketError::InvalidConfig(format!(
                "epsilon must lie in (0, 1], got {}",
                self.epsilon
            )));
        }
        if self.n_quality == 0 {
            return Err(MarketError::InvalidConfig("n_quality must be positive".into()));
        }
        if self.max_rounds == Some(0) {
            return Err(MarketError::InvalidConfig("max_rounds must be positive".into()));
        }
        self.stats.validate()
    }
}

/// Smoothing constants of [`MarketStats`](crate::stats::MarketStats).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Decay of the per-quality average sale price on each sale (G).
    pub sale_price_decay: f64,
    /// Decay of the average days on market on each sale (E).
    pub days_on_market_decay: f64,
    /// Decay of the average sale prices toward the index-implied prices.
    pub price_index_decay: f64,
    /// Months of house price index kept (HPA years * 12 + one quarter).
    pub hpi_record_length: usize,
    pub days_in_month: f64,
    /// Sales needed in a month before the house price index is re-estimated.
    pub min_sales_for_index: u32,
}

impl Default for StatsConfig {
    fn default() -> Self {
        // T = 0.02 * target population (10_000 households)
        let t = 200.0_f64;
        Self {
            sale_price_decay: (-48.0 / t).exp(),
            days_on_market_decay: (-1.0 / t).exp(),
            price_index_decay: 0.25,
            hpi_record_length: 5 * 12 + 3,
            days_in_month: 30.0,
            min_sales_for_index: 5,
        }
    }
}

impl StatsConfig {
    pub fn validate(&self) -> Result<(), MarketError> {
        for (name, value) in [
            ("sale_price_decay", self.sale_price_decay),
            ("days_on_market_decay", self.days_on_market_decay),
            ("price_index_decay", self.price_index_decay),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MarketError::InvalidConfig(format!(
                    "{name} must lie in [0, 1], got {value}"
                )));
            }
        }
        if self.hpi_record_length < 3 {
            return Err(MarketError::InvalidConfig(
                "hpi_record_length must cover at least one quarter".into(),
            ));
        }
        if !(self.days_in_month > 0.0) {
            return Err(MarketError::InvalidConfig("days_in_month must be positive".into()));
        }
        Ok(())
    }
}

/// Everything needed to start a [`Simulation`](crate::Simulation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: u64,
    pub market: MarketConfig,
    /// Index-neutral sale price per quality band.
    pub sale_reference_prices: Vec<f64>,
    /// Index-neutral monthly rent per quality band.
    pub rental_reference_prices: Vec<f64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let market = MarketConfig::default();
        let n = market.n_quality as usize;
        // Prices double from the lowest to the highest band
        let ramp = |base: f64| -> Vec<f64> {
            (0..n).map(|q| base * (1.0 + q as f64 / n as f64)).collect()
        };
        Self {
            seed: 42,
            sale_reference_prices: ramp(150_000.0),
            rental_reference_prices: ramp(600.0),
            market,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), MarketError> {
        self.market.validate()?;
        let n = self.market.n_quality as usize;
        for (name, prices) in [
            ("sale_reference_prices", &self.sale_reference_prices),
            ("rental_reference_prices", &self.rental_reference_prices),
        ] {
            if prices.len() != n {
                return Err(MarketError::InvalidConfig(format!(
                    "{name} has {} entries, expected one per quality band ({n})",
                    prices.len()
                )));
            }
        }
        Ok(())
    }
}
