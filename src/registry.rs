//! In-memory buyer registry
//!
//! Lưu email của buyer từ lúc mua đến lúc lấy hàng. Chỉ tồn tại trong process.

use std::collections::HashMap;

use ethers::types::{Address, U256};
use tracing::debug;

use crate::types::BuyerRecord;

/// Buyer address to latest purchase; owned by the relay worker
#[derive(Debug, Default)]
pub struct BuyerRegistry {
    buyers: HashMap<Address, BuyerRecord>,
}

impl BuyerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a purchase; a later purchase by the same buyer replaces the earlier one
    pub fn record_purchase(&mut self, buyer: Address, amount: U256, email: String) {
        let record = BuyerRecord {
            buyer_address: buyer,
            email,
            purchased_amount: amount,
        };
        if let Some(previous) = self.buyers.insert(buyer, record) {
            debug!(
                "Buyer {:?} purchased again, replacing record (email {})",
                buyer, previous.email
            );
        }
    }

    pub fn get(&self, buyer: &Address) -> Option<&BuyerRecord> {
        self.buyers.get(buyer)
    }

    pub fn len(&self) -> usize {
        self.buyers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buyers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_purchase_wins() {
        let buyer = Address::repeat_byte(0x01);
        let mut registry = BuyerRegistry::new();
        registry.record_purchase(buyer, U256::from(10), "a@x.com".to_string());
        registry.record_purchase(buyer, U256::from(25), "b@x.com".to_string());

        let record = registry.get(&buyer).unwrap();
        assert_eq!(record.email, "b@x.com");
        assert_eq!(record.purchased_amount, U256::from(25));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_buyer_is_absent() {
        let registry = BuyerRegistry::new();
        assert!(registry.get(&Address::repeat_byte(0x02)).is_none());
        assert!(registry.is_empty());
    }
}
