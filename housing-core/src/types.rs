use serde::{Deserialize, Serialize};
use slotmap::{KeyData, new_key_type};
use tsify_next::Tsify;

// ============================================================================
// IDs - Using slotmap for generational indices
// ============================================================================

new_key_type! {
    pub struct PropertyId;
    pub struct OfferId;
    pub struct AgentId;
}

/// Trait for converting SlotMap keys to u64 for the WASM boundary
pub trait KeyToU64 {
    fn to_u64(self) -> u64;
    fn from_u64(value: u64) -> Self;
}

impl KeyToU64 for PropertyId {
    fn to_u64(self) -> u64 {
        self.0.as_ffi()
    }

    fn from_u64(value: u64) -> Self {
        Self::from(KeyData::from_ffi(value))
    }
}

impl KeyToU64 for OfferId {
    fn to_u64(self) -> u64 {
        self.0.as_ffi()
    }

    fn from_u64(value: u64) -> Self {
        Self::from(KeyData::from_ffi(value))
    }
}

impl KeyToU64 for AgentId {
    fn to_u64(self) -> u64 {
        self.0.as_ffi()
    }

    fn from_u64(value: u64) -> Self {
        Self::from(KeyData::from_ffi(value))
    }
}

// ============================================================================
// Scalars
// ============================================================================

pub type Price = f64;
/// Discretized quality band, `0..n_quality`.
pub type Quality = u32;
/// Simulated month counter.
pub type Month = u32;

// ============================================================================
// Market kind - which side of the housing market a record lives on
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Tsify)]
#[tsify(into_wasm_abi, from_wasm_abi)]
pub enum MarketKind {
    /// Ownership market: offers are indexed by quality and by yield.
    Sale,
    /// Rental market: offers are indexed by quality only.
    Rental,
}

impl MarketKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MarketKind::Sale => "sale",
            MarketKind::Rental => "rental",
        }
    }
}

/// `true` if `price` can be used as a listing price, bid or ceiling.
pub fn is_valid_price(price: Price) -> bool {
    price.is_finite() && price >= 0.0
}
