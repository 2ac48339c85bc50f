//! Running price statistics of one market.
//!
//! Sale prices are smoothed per quality band as they happen. Once a month the
//! ratio of sold prices to reference prices becomes the house price index,
//! which pulls every band's average toward its index-implied price.

use std::collections::VecDeque;

use crate::config::StatsConfig;
use crate::error::MarketError;
use crate::market::{Bid, Offer};
use crate::types::{Month, Price, Quality, is_valid_price};

/// Receives every completed match.
pub trait TransactionRecorder {
    /// `offer` carries the final transaction price; `month` is the clearing month.
    fn record_transaction(&mut self, bid: &Bid, offer: &Offer, month: Month);
}

/// Discards every record.
impl TransactionRecorder for () {
    fn record_transaction(&mut self, _bid: &Bid, _offer: &Offer, _month: Month) {}
}

#[derive(Debug, Clone)]
pub struct MarketStats {
    config: StatsConfig,
    reference_prices: Vec<Price>,
    average_sale_price: Vec<Price>,
    average_days_on_market: f64,
    house_price_index: f64,
    hpi_record: VecDeque<f64>,

    // Accumulated since the last index update
    sold_price_sum: f64,
    sold_reference_sum: f64,
    n_sold: u32,
}

impl MarketStats {
    /// `reference_prices[q]` is the index-neutral price of quality band `q`.
    pub fn new(reference_prices: Vec<Price>, config: StatsConfig) -> Result<Self, MarketError> {
        config.validate()?;
        if reference_prices.is_empty() {
            return Err(MarketError::InvalidConfig(
                "at least one reference price is required".into(),
            ));
        }
        if let Some(bad) = reference_prices.iter().copied().find(|p| !is_valid_price(*p)) {
            return Err(MarketError::InvalidPrice(bad));
        }

        let hpi_record = std::iter::repeat_n(1.0, config.hpi_record_length).collect();
        Ok(Self {
            average_sale_price: reference_prices.clone(),
            reference_prices,
            average_days_on_market: config.days_in_month,
            house_price_index: 1.0,
            hpi_record,
            sold_price_sum: 0.0,
            sold_reference_sum: 0.0,
            n_sold: 0,
            config,
        })
    }

    pub fn reference_price(&self, quality: Quality) -> Option<Price> {
        self.reference_prices.get(quality as usize).copied()
    }

    /// Smoothed sale price of `quality`. Non-positive averages read as 0.01.
    pub fn average_sale_price(&self, quality: Quality) -> Price {
        match self.average_sale_price.get(quality as usize).copied() {
            Some(p) if p > 0.0 => p,
            _ => 0.01,
        }
    }

    pub fn average_sale_prices(&self) -> &[Price] {
        &self.average_sale_price
    }

    pub fn average_days_on_market(&self) -> f64 {
        self.average_days_on_market
    }

    pub fn house_price_index(&self) -> f64 {
        self.house_price_index
    }

    /// Monthly index values, oldest first.
    pub fn hpi_record(&self) -> impl Iterator<Item = f64> + '_ {
        self.hpi_record.iter().copied()
    }

    /// Sales since the last index update.
    pub fn n_sold(&self) -> u32 {
        self.n_sold
    }

    /// Best quality band whose average sale price is within `price`.
    pub fn max_quality_given_price(&self, price: Price) -> Option<Quality> {
        self.average_sale_price
            .iter()
            .rposition(|&p| p <= price)
            .map(|q| q as Quality)
    }

    /// Annualised index growth over `years`, comparing the last quarter with
    /// the same quarter `years` earlier.
    pub fn house_price_appreciation(&self, years: u32) -> Option<f64> {
        let len = self.hpi_record.len();
        let offset = years as usize * 12;
        if years == 0 || offset + 3 > len {
            return None;
        }
        let quarter_ending = |end: usize| -> f64 { (end - 3..end).map(|i| self.hpi_record[i]).sum() };
        let now = quarter_ending(len);
        let then = quarter_ending(len - offset);
        if then <= 0.0 {
            return None;
        }
        Some((now / then).powf(1.0 / years as f64) - 1.0)
    }

    /// Close the month: re-estimate the index if enough sales happened, then
    /// append it to the record.
    pub fn record_market_stats(&mut self) {
        if self.n_sold >= self.config.min_sales_for_index && self.sold_reference_sum > 0.0 {
            let m = self.sold_price_sum / self.sold_reference_sum;
            self.house_price_index = m;
            let decay = self.config.price_index_decay;
            for (avg, reference) in self
                .average_sale_price
                .iter_mut()
                .zip(&self.reference_prices)
            {
                *avg = decay * *avg + (1.0 - decay) * m * reference;
            }
            self.sold_price_sum = 0.0;
            self.sold_reference_sum = 0.0;
            self.n_sold = 0;
        }

        self.hpi_record.push_back(self.house_price_index);
        while self.hpi_record.len() > self.config.hpi_record_length {
            self.hpi_record.pop_front();
        }

        #[cfg(feature = "instrument")]
        tracing::info!(
            target: "market_stats",
            house_price_index = self.house_price_index,
            average_days_on_market = self.average_days_on_market,
        );
    }
}

impl TransactionRecorder for MarketStats {
    fn record_transaction(&mut self, _bid: &Bid, offer: &Offer, month: Month) {
        let Some(reference) = self.reference_price(offer.quality) else {
            return;
        };
        let e = self.config.days_on_market_decay;
        let days = self.config.days_in_month * offer.months_on_market(month) as f64;
        self.average_days_on_market = e * self.average_days_on_market + (1.0 - e) * days;

        let g = self.config.sale_price_decay;
        if let Some(avg) = self.average_sale_price.get_mut(offer.quality as usize) {
            *avg = g * *avg + (1.0 - g) * offer.price();
        }

        self.sold_price_sum += offer.price();
        self.sold_reference_sum += reference;
        self.n_sold += 1;
    }
}
