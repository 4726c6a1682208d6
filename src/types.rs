/// Shared data types for the potato relay
///
/// Buyer records, queued chain events, locker signatures and the
/// transaction status shape returned by the API.

use std::fmt;

use chrono::{DateTime, Utc};
use ethers::types::{Address, Signature, H256, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lockers are numbered 0-255, matching the contract's `uint8`
pub type LockerNumber = u8;

/// What the relay remembers about a buyer between their purchase and pickup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyerRecord {
    /// Buyer's on-chain address
    pub buyer_address: Address,
    /// Where lifecycle emails go
    pub email: String,
    /// Amount from the latest purchase, in token base units
    pub purchased_amount: U256,
}

/// Kind-specific payload of a vendor contract event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VendorEvent {
    /// Buyer paid (via permit) and left an email for notifications
    Purchase {
        buyer: Address,
        amount: U256,
        email: String,
    },
    /// The contract reserved a locker for the buyer
    LockerAssigned {
        buyer: Address,
        locker_number: LockerNumber,
    },
    /// The buyer opened their locker with a valid signature
    LockerOpened {
        buyer: Address,
        locker_number: LockerNumber,
    },
}

impl VendorEvent {
    /// Event kind label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            VendorEvent::Purchase { .. } => "purchase",
            VendorEvent::LockerAssigned { .. } => "locker_assigned",
            VendorEvent::LockerOpened { .. } => "locker_opened",
        }
    }

    /// Buyer the event concerns
    pub fn buyer(&self) -> Address {
        match self {
            VendorEvent::Purchase { buyer, .. }
            | VendorEvent::LockerAssigned { buyer, .. }
            | VendorEvent::LockerOpened { buyer, .. } => *buyer,
        }
    }
}

/// A chain event waiting in the relay queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEvent {
    /// Correlation id for logs
    pub id: Uuid,
    /// Decoded event
    pub event: VendorEvent,
    /// Block the log was emitted in (None for locally injected events)
    pub block_number: Option<u64>,
    /// Transaction that emitted the log
    pub transaction_hash: Option<H256>,
    /// When the listener picked it up
    pub received_at: DateTime<Utc>,
}

impl QueuedEvent {
    /// Wrap a decoded event with fresh queue metadata
    pub fn new(event: VendorEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
            block_number: None,
            transaction_hash: None,
            received_at: Utc::now(),
        }
    }

    /// Attach the log origin
    pub fn with_origin(mut self, block_number: Option<u64>, transaction_hash: Option<H256>) -> Self {
        self.block_number = block_number;
        self.transaction_hash = transaction_hash;
        self
    }
}

impl fmt::Display for QueuedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] buyer={:?}", self.event.kind(), self.id, self.event.buyer())
    }
}

/// ECDSA signature components as the contract takes them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockerSignature {
    pub v: u8,
    pub r: H256,
    pub s: H256,
}

impl LockerSignature {
    /// Convert into the ethers signature type used for recovery
    pub fn to_ethers(&self) -> Signature {
        Signature {
            r: U256::from_big_endian(self.r.as_bytes()),
            s: U256::from_big_endian(self.s.as_bytes()),
            v: u64::from(self.v),
        }
    }
}

impl TryFrom<Signature> for LockerSignature {
    type Error = String;

    fn try_from(sig: Signature) -> Result<Self, Self::Error> {
        let v = u8::try_from(sig.v).map_err(|_| format!("v value {} does not fit in a byte", sig.v))?;
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        sig.r.to_big_endian(&mut r);
        sig.s.to_big_endian(&mut s);
        Ok(Self {
            v,
            r: H256::from(r),
            s: H256::from(s),
        })
    }
}

/// A request to open a locker, already parsed from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockerOpenRequest {
    pub locker_number: LockerNumber,
    pub signer: Address,
    pub signature: LockerSignature,
    pub message_hash: H256,
}

/// An off-chain signed token permit carrying the buyer's email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermitRequest {
    pub owner: Address,
    pub spender: Address,
    pub value: U256,
    pub deadline: U256,
    pub signature: LockerSignature,
    pub email: String,
}

/// Where a submitted transaction stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    /// No receipt yet
    Pending,
    /// Mined with status 1
    Success,
    /// Mined but reverted
    Error,
}
