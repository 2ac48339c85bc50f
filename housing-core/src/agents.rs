use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

use crate::error::MarketError;
use crate::market::Offer;
use crate::types::{AgentId, Month, Price, PropertyId};

// === TENANCIES ===

/// A let agreed on the rental market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentalAgreement {
    pub property: PropertyId,
    pub tenant: AgentId,
    pub landlord: AgentId,
    pub monthly_rent: Price,
    pub term_months: u32,
    pub remaining_months: u32,
    pub start_month: Month,
}

/// What the market knows about a let when the tenant signs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LettingTerms {
    pub landlord: AgentId,
    pub month: Month,
    pub tenancy_length_months: u32,
}

impl RentalAgreement {
    /// Agreement on the default terms for `offer`.
    pub fn standard(tenant: AgentId, offer: &Offer, terms: &LettingTerms) -> Self {
        Self {
            property: offer.property,
            tenant,
            landlord: terms.landlord,
            monthly_rent: offer.price(),
            term_months: terms.tenancy_length_months,
            remaining_months: terms.tenancy_length_months,
            start_month: terms.month,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.remaining_months == 0
    }
}

// === CAPABILITIES ===

/// Callbacks received by the owner of a listed property.
pub trait HouseOwner {
    fn complete_house_sale(&mut self, owner: AgentId, offer: &Offer) -> Result<(), MarketError>;

    fn complete_house_let(
        &mut self,
        owner: AgentId,
        offer: &Offer,
        agreement: &RentalAgreement,
    ) -> Result<(), MarketError>;

    /// A tenancy of `property` ended. Returns the rent to re-list the
    /// property at, or `None` to keep it off the rental market.
    fn end_of_letting_agreement(
        &mut self,
        owner: AgentId,
        property: PropertyId,
        agreement: &RentalAgreement,
    ) -> Result<Option<Price>, MarketError>;
}

/// Callbacks received by the winner of a bid.
pub trait HouseBidder {
    fn complete_house_purchase(
        &mut self,
        buyer: AgentId,
        offer: &Offer,
        desired_down_payment: Price,
    ) -> Result<(), MarketError>;

    fn complete_house_rental(
        &mut self,
        tenant: AgentId,
        offer: &Offer,
        terms: &LettingTerms,
    ) -> Result<RentalAgreement, MarketError>;

    /// The tenancy ended: it expired, the tenant bought a home, or the
    /// property was sold from under them.
    fn tenancy_terminated(&mut self, _agreement: &RentalAgreement) -> Result<(), MarketError> {
        Ok(())
    }
}

/// Everything the settlement of both markets calls back into.
pub trait Participants: HouseOwner + HouseBidder {}

impl<T: HouseOwner + HouseBidder + ?Sized> Participants for T {}

// ============================================================================
// Ledger - bookkeeping participants
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    pub cash: f64,
    pub owned: BTreeSet<PropertyId>,
    /// Property the agent lives in, owned or rented.
    pub residence: Option<PropertyId>,
    pub rental_income: Price,
    pub rent_due: Price,
}

impl Account {
    pub fn with_cash(mut self, cash: f64) -> Self {
        self.cash = cash;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerEvent {
    Sold { seller: AgentId, property: PropertyId, price: Price },
    Bought { buyer: AgentId, property: PropertyId, price: Price, down_payment: Price },
    Let { landlord: AgentId, property: PropertyId, rent: Price },
    Rented { tenant: AgentId, property: PropertyId, rent: Price },
    TenancyEnded { landlord: AgentId, property: PropertyId },
    MovedOut { tenant: AgentId, property: PropertyId },
}

/// Agents that settle every transaction in cash and re-let at the old rent.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    accounts: SlotMap<AgentId, Account>,
    events: Vec<LedgerEvent>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_agent(&mut self, account: Account) -> AgentId {
        self.accounts.insert(account)
    }

    pub fn get_agent(&self, id: AgentId) -> Option<&Account> {
        self.accounts.get(id)
    }

    pub fn get_agent_mut(&mut self, id: AgentId) -> Option<&mut Account> {
        self.accounts.get_mut(id)
    }

    pub fn agents(&self) -> impl Iterator<Item = (AgentId, &Account)> + '_ {
        self.accounts.iter()
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn total_cash(&self) -> f64 {
        self.accounts.values().map(|a| a.cash).sum()
    }

    fn account(&mut self, id: AgentId) -> Result<&mut Account, MarketError> {
        self.accounts.get_mut(id).ok_or(MarketError::UnknownAgent(id))
    }
}

impl HouseOwner for Ledger {
    fn complete_house_sale(&mut self, owner: AgentId, offer: &Offer) -> Result<(), MarketError> {
        let account = self.account(owner)?;
        account.cash += offer.price();
        account.owned.remove(&offer.property);
        if account.residence == Some(offer.property) {
            account.residence = None;
        }
        self.events.push(LedgerEvent::Sold {
            seller: owner,
            property: offer.property,
            price: offer.price(),
        });
        Ok(())
    }

    fn complete_house_let(
        &mut self,
        owner: AgentId,
        offer: &Offer,
        agreement: &RentalAgreement,
    ) -> Result<(), MarketError> {
        self.account(owner)?.rental_income += agreement.monthly_rent;
        self.events.push(LedgerEvent::Let {
            landlord: owner,
            property: offer.property,
            rent: agreement.monthly_rent,
        });
        Ok(())
    }

    fn end_of_letting_agreement(
        &mut self,
        owner: AgentId,
        property: PropertyId,
        agreement: &RentalAgreement,
    ) -> Result<Option<Price>, MarketError> {
        let account = self.account(owner)?;
        account.rental_income -= agreement.monthly_rent;
        let relist = account.owned.contains(&property).then_some(agreement.monthly_rent);
        self.events.push(LedgerEvent::TenancyEnded {
            landlord: owner,
            property,
        });
        Ok(relist)
    }
}

impl HouseBidder for Ledger {
    fn complete_house_purchase(
        &mut self,
        buyer: AgentId,
        offer: &Offer,
        desired_down_payment: Price,
    ) -> Result<(), MarketError> {
        let account = self.account(buyer)?;
        account.cash -= offer.price();
        account.owned.insert(offer.property);
        if account.residence.is_none() {
            account.residence = Some(offer.property);
        }
        self.events.push(LedgerEvent::Bought {
            buyer,
            property: offer.property,
            price: offer.price(),
            down_payment: desired_down_payment,
        });
        Ok(())
    }

    fn complete_house_rental(
        &mut self,
        tenant: AgentId,
        offer: &Offer,
        terms: &LettingTerms,
    ) -> Result<RentalAgreement, MarketError> {
        let agreement = RentalAgreement::standard(tenant, offer, terms);
        let account = self.account(tenant)?;
        account.rent_due += agreement.monthly_rent;
        account.residence = Some(offer.property);
        self.events.push(LedgerEvent::Rented {
            tenant,
            property: offer.property,
            rent: agreement.monthly_rent,
        });
        Ok(agreement)
    }

    fn tenancy_terminated(&mut self, agreement: &RentalAgreement) -> Result<(), MarketError> {
        let account = self.account(agreement.tenant)?;
        account.rent_due -= agreement.monthly_rent;
        if account.residence == Some(agreement.property) {
            account.residence = None;
        }
        self.events.push(LedgerEvent::MovedOut {
            tenant: agreement.tenant,
            property: agreement.property,
        });
        Ok(())
    }
}
