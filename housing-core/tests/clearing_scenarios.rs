//! End-to-end clearing scenarios on a world with bookkeeping agents.

use housing_core::{
    Account, AgentId, Ledger, LedgerEvent, MarketConfig, MarketError, MarketStats, PropertyId,
    Simulation, SimulationConfig, StatsConfig, World,
};
use rand::SeedableRng;
use rand::rngs::StdRng;

// === TEST FIXTURES ===

struct Fixture {
    world: World,
    ledger: Ledger,
    rng: StdRng,
}

impl Fixture {
    fn new(config: MarketConfig) -> Self {
        Self {
            world: World::new(config).unwrap(),
            ledger: Ledger::new(),
            rng: StdRng::seed_from_u64(42),
        }
    }

    fn agent(&mut self, cash: f64) -> AgentId {
        self.ledger.add_agent(Account::default().with_cash(cash))
    }

    fn property(&mut self, quality: u32, owner: AgentId) -> PropertyId {
        let id = self.world.add_property(quality, owner).unwrap();
        self.ledger.get_agent_mut(owner).unwrap().owned.insert(id);
        id
    }

    fn clear_sales(&mut self) -> housing_core::ClearingReport {
        self.world
            .clear_sale_market(&mut self.rng, &mut self.ledger, &mut ())
            .unwrap()
    }

    fn clear_rentals(&mut self) -> housing_core::ClearingReport {
        self.world
            .clear_rental_market(&mut self.rng, &mut self.ledger, &mut ())
            .unwrap()
    }

    /// Let `property` to `tenant` at `rent` through the rental market.
    fn let_to(&mut self, property: PropertyId, tenant: AgentId, rent: f64) {
        self.world.offer_for_rent(property, rent).unwrap();
        self.world.bid_for_rent(tenant, rent).unwrap();
        let report = self.clear_rentals();
        assert_eq!(report.transactions.len(), 1);
        assert_eq!(self.world.tenancy_of(tenant), Some(property));
    }
}

fn no_bid_up() -> MarketConfig {
    MarketConfig {
        bid_up_factor: 1.0,
        ..Default::default()
    }
}

// === SALE MARKET ===

#[test]
fn disabled_bid_up_sells_at_listed_price_and_returns_losers() {
    let mut f = Fixture::new(no_bid_up());
    let seller = f.agent(0.0);
    let house = f.property(3, seller);
    f.world.offer_for_sale(house, 200.0, false).unwrap();
    let buyers: Vec<AgentId> = (0..3).map(|_| f.agent(1_000.0)).collect();
    for (buyer, price) in buyers.iter().zip([210.0, 220.0, 215.0]) {
        f.world.bid_for_sale(*buyer, price, false, 0.0).unwrap();
    }

    let report = f.clear_sales();

    assert_eq!(report.transactions.len(), 1);
    let sale = &report.transactions[0];
    assert_eq!(sale.price, 200.0);
    assert_eq!(sale.n_bids, 3);
    assert_eq!(sale.bid_ups, 0);
    assert_eq!(sale.seller, Some(seller));
    // losers rejoin the pool, find nothing and are dropped
    assert_eq!(report.rounds, 1);
    assert_eq!(report.discarded_bids, 2);
    assert_eq!(f.world.get_property(house).unwrap().owner, sale.buyer);
    assert_eq!(f.ledger.get_agent(seller).unwrap().cash, 200.0);
    assert_eq!(f.ledger.get_agent(sale.buyer).unwrap().cash, 800.0);
    f.world.check_consistency().unwrap();
}

#[test]
fn bid_up_price_follows_the_drawn_count() {
    let mut f = Fixture::new(MarketConfig::default());
    let seller = f.agent(0.0);
    let house = f.property(0, seller);
    f.world.offer_for_sale(house, 200.0, false).unwrap();
    for i in 0..40 {
        let buyer = f.agent(10_000.0);
        f.world
            .bid_for_sale(buyer, 200.0 + i as f64, false, 0.0)
            .unwrap();
    }

    let report = f.clear_sales();
    let sale = &report.transactions[0];
    let bid_up_price = 200.0 * 1.0075_f64.powf(sale.bid_ups as f64);
    if bid_up_price <= 239.0 {
        // someone could afford the bid-up price and pays exactly that
        assert!((sale.price - bid_up_price).abs() < 1e-9);
    } else {
        // nobody could: the highest bid wins at its own price
        assert_eq!(sale.price, 239.0);
    }
    if sale.bid_ups == 2 {
        assert!((sale.price - 203.01125).abs() < 1e-9);
    }
}

#[test]
fn sale_withdraws_the_rental_listing_of_the_same_property() {
    let mut f = Fixture::new(no_bid_up());
    let owner = f.agent(0.0);
    let buyer = f.agent(500.0);
    let house = f.property(2, owner);
    let sale_offer = f.world.offer_for_sale(house, 300.0, false).unwrap();
    let rental_offer = f.world.offer_for_rent(house, 40.0).unwrap();
    f.world.bid_for_sale(buyer, 300.0, false, 60.0).unwrap();

    let report = f.clear_sales();

    assert_eq!(report.transactions.len(), 1);
    assert_eq!(report.transactions[0].offer, sale_offer);
    let property = f.world.get_property(house).unwrap();
    assert_eq!(property.sale_offer, None);
    assert_eq!(property.rental_offer, None);
    assert!(f.world.rental_market().get_offer(rental_offer).is_none());
    assert_eq!(f.world.rental_market().offer_count(), 0);
    assert!(f.ledger.events().contains(&LedgerEvent::Bought {
        buyer,
        property: house,
        price: 300.0,
        down_payment: 60.0,
    }));
    f.world.check_consistency().unwrap();
}

#[test]
fn owners_do_not_buy_their_own_listing() {
    let mut f = Fixture::new(no_bid_up());
    let owner = f.agent(1_000.0);
    let other = f.agent(0.0);
    let own = f.property(10, owner);
    let theirs = f.property(4, other);
    f.world.offer_for_sale(own, 100.0, false).unwrap();
    f.world.offer_for_sale(theirs, 100.0, false).unwrap();
    f.world.bid_for_sale(owner, 150.0, false, 0.0).unwrap();

    let report = f.clear_sales();

    assert_eq!(report.transactions.len(), 1);
    assert_eq!(report.transactions[0].property, theirs);
    assert!(f.world.get_property(own).unwrap().sale_offer.is_some());
    f.world.check_consistency().unwrap();
}

#[test]
fn clearing_always_terminates_with_no_pending_bids() {
    let mut f = Fixture::new(MarketConfig::default());
    let sellers: Vec<AgentId> = (0..5).map(|_| f.agent(0.0)).collect();
    for (i, seller) in sellers.iter().enumerate() {
        let house = f.property(i as u32, *seller);
        f.world
            .offer_for_sale(house, 100.0 + 10.0 * i as f64, false)
            .unwrap();
    }
    for i in 0..30 {
        let buyer = f.agent(1_000.0);
        f.world
            .bid_for_sale(buyer, 90.0 + 5.0 * i as f64, false, 0.0)
            .unwrap();
    }

    let report = f.clear_sales();

    assert!(report.rounds <= 5);
    assert_eq!(report.transactions.len() + report.discarded_bids, 30);
    assert!(f.world.sale_market().pending_bids().is_empty());
    f.world.check_consistency().unwrap();
}

#[test]
fn same_seed_gives_identical_transactions() {
    fn run() -> Vec<housing_core::Transaction> {
        let mut f = Fixture::new(MarketConfig::default());
        for q in 0..8 {
            let seller = f.agent(0.0);
            let house = f.property(q, seller);
            f.world
                .offer_for_sale(house, 1_000.0 + 50.0 * q as f64, false)
                .unwrap();
        }
        for i in 0..60 {
            let buyer = f.agent(5_000.0);
            f.world
                .bid_for_sale(buyer, 1_000.0 + 7.0 * i as f64, i % 4 == 0, 0.0)
                .unwrap();
        }
        f.clear_sales().transactions
    }

    assert_eq!(run(), run());
}

// === TENANCIES ===

#[test]
fn tenancy_runs_its_term_then_the_property_is_relisted() {
    let mut f = Fixture::new(no_bid_up());
    let landlord = f.agent(0.0);
    let tenant = f.agent(0.0);
    let flat = f.property(1, landlord);
    f.let_to(flat, tenant, 50.0);

    assert_eq!(f.ledger.get_agent(tenant).unwrap().rent_due, 50.0);
    assert_eq!(f.ledger.get_agent(landlord).unwrap().rental_income, 50.0);
    assert_eq!(f.world.offer_for_rent(flat, 60.0), Err(MarketError::Occupied(flat)));

    for _ in 0..17 {
        assert!(f.world.advance_tenancies(&mut f.ledger).unwrap().is_empty());
        f.world.advance_month();
    }
    assert_eq!(f.world.advance_tenancies(&mut f.ledger).unwrap(), vec![flat]);

    assert_eq!(f.world.tenancy_of(tenant), None);
    let property = f.world.get_property(flat).unwrap();
    assert!(property.tenancy.is_none());
    let relisted = property.rental_offer.unwrap();
    assert_eq!(f.world.rental_market().get_offer(relisted).unwrap().price(), 50.0);
    assert_eq!(f.ledger.get_agent(tenant).unwrap().rent_due, 0.0);
    assert_eq!(f.ledger.get_agent(tenant).unwrap().residence, None);
    f.world.check_consistency().unwrap();
}

#[test]
fn selling_a_let_property_ends_the_tenancy_without_relisting() {
    let mut f = Fixture::new(no_bid_up());
    let landlord = f.agent(0.0);
    let tenant = f.agent(0.0);
    let buyer = f.agent(1_000.0);
    let flat = f.property(1, landlord);
    f.let_to(flat, tenant, 50.0);

    f.world.offer_for_sale(flat, 400.0, true).unwrap();
    f.world.bid_for_sale(buyer, 400.0, false, 0.0).unwrap();
    f.clear_sales();

    let property = f.world.get_property(flat).unwrap();
    assert_eq!(property.owner, buyer);
    assert!(property.tenancy.is_none());
    assert!(property.rental_offer.is_none());
    assert_eq!(f.world.tenancy_of(tenant), None);
    assert!(f.ledger.events().contains(&LedgerEvent::MovedOut {
        tenant,
        property: flat,
    }));
    f.world.check_consistency().unwrap();
}

#[test]
fn renter_who_buys_gives_notice_on_the_rented_home() {
    let mut f = Fixture::new(no_bid_up());
    let landlord = f.agent(0.0);
    let seller = f.agent(0.0);
    let renter = f.agent(1_000.0);
    let flat = f.property(1, landlord);
    let house = f.property(5, seller);
    f.let_to(flat, renter, 50.0);

    f.world.offer_for_sale(house, 500.0, false).unwrap();
    f.world.bid_for_sale(renter, 600.0, false, 0.0).unwrap();
    f.clear_sales();

    assert_eq!(f.world.get_property(house).unwrap().owner, renter);
    assert_eq!(f.world.tenancy_of(renter), None);
    // the landlord still owns the flat and puts it back on the market
    assert!(f.world.get_property(flat).unwrap().rental_offer.is_some());
    assert_eq!(f.ledger.get_agent(renter).unwrap().residence, Some(house));
    f.world.check_consistency().unwrap();
}

#[test]
fn moving_tenant_frees_the_previous_let() {
    let mut f = Fixture::new(no_bid_up());
    let landlord = f.agent(0.0);
    let tenant = f.agent(0.0);
    let first = f.property(1, landlord);
    let second = f.property(6, landlord);
    f.let_to(first, tenant, 50.0);
    f.let_to(second, tenant, 70.0);

    assert_eq!(f.world.tenancy_of(tenant), Some(second));
    assert!(f.world.get_property(first).unwrap().tenancy.is_none());
    assert!(f.world.get_property(first).unwrap().rental_offer.is_some());
    assert_eq!(f.ledger.get_agent(tenant).unwrap().rent_due, 70.0);
    f.world.check_consistency().unwrap();
}

#[test]
fn ending_a_tenancy_early_requires_one() {
    let mut f = Fixture::new(no_bid_up());
    let landlord = f.agent(0.0);
    let flat = f.property(0, landlord);
    assert_eq!(
        f.world.end_tenancy(flat, &mut f.ledger),
        Err(MarketError::NoTenancy(flat))
    );
}

// === STATISTICS ===

#[test]
fn sales_feed_market_statistics() {
    let mut f = Fixture::new(no_bid_up());
    let mut stats = MarketStats::new(vec![100.0; 48], StatsConfig::default()).unwrap();
    for _ in 0..5 {
        let seller = f.agent(0.0);
        let buyer = f.agent(1_000.0);
        let house = f.property(0, seller);
        f.world.offer_for_sale(house, 150.0, false).unwrap();
        f.world.bid_for_sale(buyer, 150.0, false, 0.0).unwrap();
    }

    let report = f
        .world
        .clear_sale_market(&mut f.rng, &mut f.ledger, &mut stats)
        .unwrap();
    assert_eq!(report.transactions.len(), 5);
    assert_eq!(stats.n_sold(), 5);
    assert!(stats.average_sale_price(0) > 100.0);

    stats.record_market_stats();
    assert!((stats.house_price_index() - 1.5).abs() < 1e-12);
}

#[test]
fn simulation_steps_months_and_collects_transactions() {
    let mut sim = Simulation::from_config(SimulationConfig::default()).unwrap();
    let seller = sim.ledger_mut().add_agent(Account::default());
    let buyer = sim
        .ledger_mut()
        .add_agent(Account::default().with_cash(500_000.0));
    let house = sim.world_mut().add_property(10, seller).unwrap();
    sim.ledger_mut()
        .get_agent_mut(seller)
        .unwrap()
        .owned
        .insert(house);
    sim.world_mut().offer_for_sale(house, 180_000.0, false).unwrap();
    sim.world_mut()
        .bid_for_sale(buyer, 200_000.0, false, 20_000.0)
        .unwrap();

    let summary = sim.step().unwrap();

    assert_eq!(summary.month, 0);
    assert_eq!(summary.sales, 1);
    assert_eq!(summary.lets, 0);
    assert_eq!(sim.world().month(), 1);
    assert_eq!(sim.transactions().len(), 1);
    assert_eq!(sim.sale_stats().n_sold(), 1);
    sim.world().check_consistency().unwrap();
}

// === EVENT LOG ===

#[cfg(feature = "instrument")]
#[test]
fn transactions_are_logged_per_target() {
    let mut f = Fixture::new(no_bid_up());
    for q in 0..3 {
        let seller = f.agent(0.0);
        let buyer = f.agent(1_000.0);
        let house = f.property(q, seller);
        f.world.offer_for_sale(house, 100.0, false).unwrap();
        f.world.bid_for_sale(buyer, 100.0, false, 0.0).unwrap();
    }

    let (report, log) = housing_core::instrument::capture(|| f.clear_sales());

    assert_eq!(report.transactions.len(), 3);
    assert_eq!(log.rows("transaction"), 3);
    // every bid chases the best band first, so each round sells one house
    assert_eq!(report.rounds, 3);
    assert_eq!(log.rows("clearing"), 3);
    let sales = log.dataframe("transaction").unwrap();
    let summary = housing_core::instrument::transaction_summary(&sales).unwrap();
    assert_eq!(summary.height(), 3);
}

#[cfg(feature = "instrument")]
#[test]
fn logged_revenue_per_round_matches_the_report() {
    use polars::prelude::*;

    let mut f = Fixture::new(no_bid_up());
    for (q, price) in [(0, 100.0), (1, 110.0), (2, 120.0)] {
        let seller = f.agent(0.0);
        let buyer = f.agent(1_000.0);
        let house = f.property(q, seller);
        f.world.offer_for_sale(house, price, false).unwrap();
        f.world.bid_for_sale(buyer, 200.0, false, 0.0).unwrap();
    }

    let (report, log) = housing_core::instrument::capture(|| f.clear_sales());

    let revenue = log
        .dataframe("transaction")
        .unwrap()
        .lazy()
        .group_by([col("round")])
        .agg([col("price").sum().alias("revenue")])
        .sort(["round"], Default::default())
        .collect()
        .unwrap();
    let logged: Vec<f64> = revenue
        .column("revenue")
        .unwrap()
        .f64()
        .unwrap()
        .into_no_null_iter()
        .collect();
    let reported: Vec<f64> = report.transactions.iter().map(|t| t.price).collect();
    // one sale per round, best band first
    assert_eq!(logged, vec![120.0, 110.0, 100.0]);
    assert_eq!(logged, reported);
}
