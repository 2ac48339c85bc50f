// World state for the housing market simulation

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

use crate::agents::{LettingTerms, Participants, RentalAgreement};
use crate::config::MarketConfig;
use crate::error::MarketError;
use crate::market::{Bid, ClearingReport, HousingMarket, Offer, Settlement};
use crate::stats::TransactionRecorder;
use crate::types::{AgentId, Month, OfferId, Price, PropertyId, Quality};

#[cfg(feature = "instrument")]
use crate::types::KeyToU64;

/// A dwelling. Listings and tenancy are the only mutable parts besides the owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub quality: Quality,
    pub owner: AgentId,
    pub sale_offer: Option<OfferId>,
    pub rental_offer: Option<OfferId>,
    pub tenancy: Option<RentalAgreement>,
}

/// Properties plus both markets, kept mutually consistent.
#[derive(Debug, Clone)]
pub struct World {
    month: Month,
    properties: SlotMap<PropertyId, Property>,
    sale: HousingMarket,
    rental: HousingMarket,
    /// Tenant -> rented property
    tenants: HashMap<AgentId, PropertyId>,
}

impl World {
    pub fn new(config: MarketConfig) -> Result<Self, MarketError> {
        Ok(Self {
            month: 0,
            properties: SlotMap::with_key(),
            sale: HousingMarket::sale(config.clone())?,
            rental: HousingMarket::rental(config)?,
            tenants: HashMap::new(),
        })
    }

    pub fn month(&self) -> Month {
        self.month
    }

    pub fn advance_month(&mut self) {
        self.month += 1;
        self.sale.set_month(self.month);
        self.rental.set_month(self.month);
    }

    pub fn sale_market(&self) -> &HousingMarket {
        &self.sale
    }

    pub fn rental_market(&self) -> &HousingMarket {
        &self.rental
    }

    // === Property Management ===

    pub fn add_property(&mut self, quality: Quality, owner: AgentId) -> Result<PropertyId, MarketError> {
        let n_quality = self.sale.config().n_quality;
        if quality >= n_quality {
            return Err(MarketError::InvalidQuality { quality, n_quality });
        }
        Ok(self.properties.insert(Property {
            quality,
            owner,
            sale_offer: None,
            rental_offer: None,
            tenancy: None,
        }))
    }

    pub fn get_property(&self, id: PropertyId) -> Option<&Property> {
        self.properties.get(id)
    }

    pub fn properties(&self) -> impl Iterator<Item = (PropertyId, &Property)> + '_ {
        self.properties.iter()
    }

    /// Property `tenant` currently rents.
    pub fn tenancy_of(&self, tenant: AgentId) -> Option<PropertyId> {
        self.tenants.get(&tenant).copied()
    }

    fn property(&self, id: PropertyId) -> Result<&Property, MarketError> {
        self.properties.get(id).ok_or(MarketError::UnknownProperty(id))
    }

    fn property_mut(&mut self, id: PropertyId) -> Result<&mut Property, MarketError> {
        self.properties
            .get_mut(id)
            .ok_or(MarketError::UnknownProperty(id))
    }

    // === Listings ===

    pub fn offer_for_sale(
        &mut self,
        property: PropertyId,
        price: Price,
        is_investment: bool,
    ) -> Result<OfferId, MarketError> {
        let quality = self.property(property)?.quality;
        let id = self.sale.offer(property, quality, price, is_investment)?;
        self.property_mut(property)?.sale_offer = Some(id);
        Ok(id)
    }

    pub fn offer_for_rent(&mut self, property: PropertyId, rent: Price) -> Result<OfferId, MarketError> {
        let p = self.property(property)?;
        if p.tenancy.is_some() {
            return Err(MarketError::Occupied(property));
        }
        let quality = p.quality;
        let id = self.rental.offer(property, quality, rent, true)?;
        self.property_mut(property)?.rental_offer = Some(id);
        Ok(id)
    }

    pub fn update_sale_price(&mut self, property: PropertyId, price: Price) -> Result<(), MarketError> {
        let id = self
            .property(property)?
            .sale_offer
            .ok_or(MarketError::NotListed(property))?;
        self.sale.update_offer(id, price)
    }

    pub fn update_rent(&mut self, property: PropertyId, rent: Price) -> Result<(), MarketError> {
        let id = self
            .property(property)?
            .rental_offer
            .ok_or(MarketError::NotListed(property))?;
        self.rental.update_offer(id, rent)
    }

    pub fn withdraw_sale(&mut self, property: PropertyId) -> Result<Offer, MarketError> {
        let id = self
            .property_mut(property)?
            .sale_offer
            .take()
            .ok_or(MarketError::NotListed(property))?;
        self.sale.remove_offer(id)
    }

    pub fn withdraw_rental(&mut self, property: PropertyId) -> Result<Offer, MarketError> {
        let id = self
            .property_mut(property)?
            .rental_offer
            .take()
            .ok_or(MarketError::NotListed(property))?;
        self.rental.remove_offer(id)
    }

    /// Expected annual rent per quality band, for sale-offer yields.
    pub fn set_expected_rents(&mut self, rents: Vec<Price>) -> Result<(), MarketError> {
        self.sale.set_expected_rents(rents)
    }

    // === Bids ===

    pub fn bid_for_sale(
        &mut self,
        bidder: AgentId,
        price: Price,
        yield_driven: bool,
        desired_down_payment: Price,
    ) -> Result<(), MarketError> {
        self.sale
            .bid(bidder, price, yield_driven, desired_down_payment)
    }

    pub fn bid_for_rent(&mut self, bidder: AgentId, price: Price) -> Result<(), MarketError> {
        self.rental.bid(bidder, price, false, 0.0)
    }

    // === Clearing ===

    pub fn clear_sale_market<R, P, T>(
        &mut self,
        rng: &mut R,
        participants: &mut P,
        recorder: &mut T,
    ) -> Result<ClearingReport, MarketError>
    where
        R: Rng + ?Sized,
        P: Participants + ?Sized,
        T: TransactionRecorder + ?Sized,
    {
        let mut ctx = SaleSettlement {
            occupancy: Occupancy::new(&mut self.properties, &mut self.tenants),
            rental: &mut self.rental,
            participants,
            recorder,
            month: self.month,
        };
        let report = self.sale.clear_market(rng, &mut ctx)?;
        let relists = std::mem::take(&mut ctx.occupancy.relists);
        self.relist(relists)?;
        Ok(report)
    }

    pub fn clear_rental_market<R, P, T>(
        &mut self,
        rng: &mut R,
        participants: &mut P,
        recorder: &mut T,
    ) -> Result<ClearingReport, MarketError>
    where
        R: Rng + ?Sized,
        P: Participants + ?Sized,
        T: TransactionRecorder + ?Sized,
    {
        let tenancy_length_months = self.rental.config().tenancy_length_months;
        let mut ctx = RentalSettlement {
            occupancy: Occupancy::new(&mut self.properties, &mut self.tenants),
            sale: &mut self.sale,
            participants,
            recorder,
            month: self.month,
            tenancy_length_months,
        };
        let report = self.rental.clear_market(rng, &mut ctx)?;
        let relists = std::mem::take(&mut ctx.occupancy.relists);
        self.relist(relists)?;
        Ok(report)
    }

    // === Tenancies ===

    /// End the tenancy of `property` early. The landlord may re-list it.
    pub fn end_tenancy<P>(
        &mut self,
        property: PropertyId,
        participants: &mut P,
    ) -> Result<RentalAgreement, MarketError>
    where
        P: Participants + ?Sized,
    {
        let mut occupancy = Occupancy::new(&mut self.properties, &mut self.tenants);
        let agreement = occupancy.end_tenancy(property, participants, true)?;
        let relists = occupancy.relists;
        self.relist(relists)?;
        Ok(agreement)
    }

    /// Put vacated properties back on the rental market unless they changed
    /// hands or found another use meanwhile.
    fn relist(&mut self, requests: Vec<Relist>) -> Result<(), MarketError> {
        for Relist { property: id, landlord, rent } in requests {
            let property = self.property(id)?;
            let vacant = property.owner == landlord
                && property.sale_offer.is_none()
                && property.rental_offer.is_none()
                && property.tenancy.is_none();
            if vacant {
                self.offer_for_rent(id, rent)?;
            }
        }
        Ok(())
    }

    /// Count every tenancy down by a month and end the expired ones.
    /// Returns the properties whose tenancy ended.
    pub fn advance_tenancies<P>(&mut self, participants: &mut P) -> Result<Vec<PropertyId>, MarketError>
    where
        P: Participants + ?Sized,
    {
        let mut expired = Vec::new();
        for (id, property) in self.properties.iter_mut() {
            if let Some(agreement) = property.tenancy.as_mut() {
                agreement.remaining_months = agreement.remaining_months.saturating_sub(1);
                if agreement.is_expired() {
                    expired.push(id);
                }
            }
        }
        for &id in &expired {
            self.end_tenancy(id, participants)?;
        }
        Ok(expired)
    }

    /// Cross-check properties, listings, tenancies and both markets.
    pub fn check_consistency(&self) -> Result<(), String> {
        for (kind, market) in [("sale", &self.sale), ("rental", &self.rental)] {
            for (id, offer) in market.offers() {
                let property = self
                    .properties
                    .get(offer.property)
                    .ok_or_else(|| format!("{kind} offer {id:?} lists an unknown property"))?;
                let listed = match kind {
                    "sale" => property.sale_offer,
                    _ => property.rental_offer,
                };
                if listed != Some(id) {
                    return Err(format!("{kind} offer {id:?} is not referenced by its property"));
                }
            }
            if market.quality_queue().len() != market.offer_count() {
                return Err(format!("{kind} quality queue out of step with its offers"));
            }
            market.quality_queue().check_invariants()?;
            if let Some(by_yield) = market.yield_queue() {
                if by_yield.len() != market.offer_count() {
                    return Err(format!("{kind} yield queue out of step with its offers"));
                }
                by_yield.check_invariants()?;
            }
        }

        for (id, property) in &self.properties {
            if property.sale_offer != self.sale.listing(id) {
                return Err(format!("property {id:?} disagrees with the sale market"));
            }
            if property.rental_offer != self.rental.listing(id) {
                return Err(format!("property {id:?} disagrees with the rental market"));
            }
            if let Some(agreement) = &property.tenancy {
                if self.tenants.get(&agreement.tenant) != Some(&id) {
                    return Err(format!("tenant of {id:?} is not indexed"));
                }
                if property.rental_offer.is_some() {
                    return Err(format!("let property {id:?} is still on the rental market"));
                }
            }
        }
        if self.tenants.len() != self.properties.values().filter(|p| p.tenancy.is_some()).count() {
            return Err("tenant index holds stale entries".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Settlement contexts
// ============================================================================

/// A landlord's request to re-let a vacated property.
struct Relist {
    property: PropertyId,
    landlord: AgentId,
    rent: Price,
}

/// Property state touched when a tenancy ends.
struct Occupancy<'a> {
    properties: &'a mut SlotMap<PropertyId, Property>,
    tenants: &'a mut HashMap<AgentId, PropertyId>,
    /// Applied once the rental market is free.
    relists: Vec<Relist>,
}

impl<'a> Occupancy<'a> {
    fn new(
        properties: &'a mut SlotMap<PropertyId, Property>,
        tenants: &'a mut HashMap<AgentId, PropertyId>,
    ) -> Self {
        Self {
            properties,
            tenants,
            relists: Vec::new(),
        }
    }

    fn owner_of(&self, property: PropertyId) -> Option<AgentId> {
        self.properties.get(property).map(|p| p.owner)
    }

    /// Remove the tenancy of `id` and notify tenant and landlord. With
    /// `relist`, a landlord's request to re-let is queued.
    fn end_tenancy<P: Participants + ?Sized>(
        &mut self,
        id: PropertyId,
        participants: &mut P,
        relist: bool,
    ) -> Result<RentalAgreement, MarketError> {
        let property = self
            .properties
            .get_mut(id)
            .ok_or(MarketError::UnknownProperty(id))?;
        let agreement = property.tenancy.take().ok_or(MarketError::NoTenancy(id))?;
        let owner = property.owner;
        self.tenants.remove(&agreement.tenant);

        participants.tenancy_terminated(&agreement)?;
        let relist_rent = participants.end_of_letting_agreement(owner, id, &agreement)?;

        #[cfg(feature = "instrument")]
        tracing::info!(
            target: "tenancy",
            property_id = id.to_u64(),
            tenant_id = agreement.tenant.to_u64(),
            landlord_id = owner.to_u64(),
            monthly_rent = agreement.monthly_rent,
            months_served = agreement.term_months.saturating_sub(agreement.remaining_months),
        );

        if let Some(rent) = relist_rent.filter(|_| relist) {
            self.relists.push(Relist {
                property: id,
                landlord: owner,
                rent,
            });
        }
        Ok(agreement)
    }
}

struct SaleSettlement<'a, P: ?Sized, T: ?Sized> {
    occupancy: Occupancy<'a>,
    rental: &'a mut HousingMarket,
    participants: &'a mut P,
    recorder: &'a mut T,
    month: Month,
}

impl<P, T> Settlement for SaleSettlement<'_, P, T>
where
    P: Participants + ?Sized,
    T: TransactionRecorder + ?Sized,
{
    fn owner_of(&self, property: PropertyId) -> Option<AgentId> {
        self.occupancy.owner_of(property)
    }

    fn complete(&mut self, bid: &Bid, offer: &Offer) -> Result<(), MarketError> {
        let id = offer.property;
        let buyer = bid.bidder;
        let (seller, rental_offer, tenanted) = {
            let property = self
                .occupancy
                .properties
                .get_mut(id)
                .ok_or(MarketError::UnknownProperty(id))?;
            property.sale_offer = None;
            (
                property.owner,
                property.rental_offer.take(),
                property.tenancy.is_some(),
            )
        };
        if let Some(rental_offer) = rental_offer {
            self.rental.remove_offer(rental_offer)?;
        }

        // The sitting tenant leaves with the sale
        if tenanted {
            self.occupancy.end_tenancy(id, &mut *self.participants, false)?;
        }
        // An owner-occupier who rents elsewhere gives notice
        if !bid.yield_driven {
            if let Some(rented) = self.occupancy.tenants.get(&buyer).copied() {
                self.occupancy.end_tenancy(rented, &mut *self.participants, true)?;
            }
        }

        self.participants.complete_house_sale(seller, offer)?;
        self.participants
            .complete_house_purchase(buyer, offer, bid.desired_down_payment)?;
        if let Some(property) = self.occupancy.properties.get_mut(id) {
            property.owner = buyer;
        }
        self.recorder.record_transaction(bid, offer, self.month);
        Ok(())
    }
}

struct RentalSettlement<'a, P: ?Sized, T: ?Sized> {
    occupancy: Occupancy<'a>,
    sale: &'a mut HousingMarket,
    participants: &'a mut P,
    recorder: &'a mut T,
    month: Month,
    tenancy_length_months: u32,
}

impl<P, T> Settlement for RentalSettlement<'_, P, T>
where
    P: Participants + ?Sized,
    T: TransactionRecorder + ?Sized,
{
    fn owner_of(&self, property: PropertyId) -> Option<AgentId> {
        self.occupancy.owner_of(property)
    }

    fn complete(&mut self, bid: &Bid, offer: &Offer) -> Result<(), MarketError> {
        let id = offer.property;
        let tenant = bid.bidder;
        let landlord = {
            let property = self
                .occupancy
                .properties
                .get_mut(id)
                .ok_or(MarketError::UnknownProperty(id))?;
            if property.tenancy.is_some() {
                return Err(MarketError::Occupied(id));
            }
            property.rental_offer = None;
            property.owner
        };

        // Moving house: the previous let ends
        if let Some(previous) = self.occupancy.tenants.get(&tenant).copied() {
            self.occupancy
                .end_tenancy(previous, &mut *self.participants, true)?;
        }

        let terms = LettingTerms {
            landlord,
            month: self.month,
            tenancy_length_months: self.tenancy_length_months,
        };
        let agreement = self
            .participants
            .complete_house_rental(tenant, offer, &terms)?;
        self.participants
            .complete_house_let(landlord, offer, &agreement)?;

        let property = self
            .occupancy
            .properties
            .get_mut(id)
            .ok_or(MarketError::UnknownProperty(id))?;
        property.tenancy = Some(agreement);
        let sale_offer = property.sale_offer.take();
        self.occupancy.tenants.insert(tenant, id);
        if let Some(sale_offer) = sale_offer {
            self.sale.remove_offer(sale_offer)?;
        }
        self.recorder.record_transaction(bid, offer, self.month);
        Ok(())
    }
}
