//! Locker-open authorization
//!
//! The vendor contract only opens a locker for the buyer who signed the
//! locker number with their own key. Before the relay spends gas on
//! `openLocker`, it repeats the contract's check off-chain:
//!
//! 1. the claimed signer is the locker's on-chain assignee
//! 2. the claimed hash is `hash_message(keccak256(uint8(locker)))`
//! 3. `ecrecover(hash, v, r, s)` yields the claimed signer
//!
//! Steps 2 and 3 are the pure [`verify_locker_signature`]; [`LockerAuthorizer`]
//! adds the chain read in front and the operator-signed `openLocker` after.

use std::sync::Arc;

use ethers::types::{Address, TxHash, H256};
use ethers::utils::{hash_message, keccak256};
use metrics::increment_counter;
use tracing::{debug, info, warn};

use crate::chain::VendorChain;
use crate::error::{RelayResult, VerificationError};
use crate::types::{LockerNumber, LockerOpenRequest, LockerSignature};

/// `keccak256(abi.encodePacked(uint8(locker)))`, the raw digest buyers sign
pub fn locker_digest(locker: LockerNumber) -> H256 {
    H256::from(keccak256([locker]))
}

/// The digest wrapped in the `"\x19Ethereum Signed Message:\n32"` prefix, as the contract recomputes it
pub fn locker_message_hash(locker: LockerNumber) -> H256 {
    hash_message(locker_digest(locker).as_bytes())
}

/// Step 1: the claimed signer must be the current assignee, and the locker must be assigned at all
pub fn check_assignee(
    locker: LockerNumber,
    assignee: Address,
    claimed_signer: Address,
) -> Result<(), VerificationError> {
    if assignee.is_zero() || assignee != claimed_signer {
        return Err(VerificationError::NotAssigned {
            locker,
            assignee,
            signer: claimed_signer,
        });
    }
    Ok(())
}

/// Steps 2 and 3: recompute the locker hash and recover the signer from it
///
/// # Errors
/// * `HashMismatch` if `claimed_hash` is not the hash the contract will compute
/// * `InvalidSignature` if `v` is not 27/28, recovery fails or yields another address
pub fn verify_locker_signature(
    locker: LockerNumber,
    claimed_signer: Address,
    signature: &LockerSignature,
    claimed_hash: H256,
) -> Result<(), VerificationError> {
    let expected = locker_message_hash(locker);
    if expected != claimed_hash {
        return Err(VerificationError::HashMismatch {
            locker,
            expected,
            received: claimed_hash,
        });
    }

    // ecrecover chỉ nhận v = 27 hoặc 28
    if signature.v != 27 && signature.v != 28 {
        return Err(VerificationError::InvalidSignature(format!(
            "v must be 27 or 28, got {}",
            signature.v
        )));
    }

    let recovered = signature
        .to_ethers()
        .recover(expected)
        .map_err(|e| VerificationError::InvalidSignature(e.to_string()))?;

    if recovered != claimed_signer {
        return Err(VerificationError::InvalidSignature(format!(
            "recovered {:?}, expected {:?}",
            recovered, claimed_signer
        )));
    }
    Ok(())
}

/// Runs the full locker-open flow against the chain
pub struct LockerAuthorizer {
    chain: Arc<dyn VendorChain>,
}

impl LockerAuthorizer {
    pub fn new(chain: Arc<dyn VendorChain>) -> Self {
        Self { chain }
    }

    /// Verify the request and, only if every check passes, submit `openLocker`
    pub async fn authorize_and_open(&self, request: &LockerOpenRequest) -> RelayResult<TxHash> {
        let locker = request.locker_number;
        debug!("Locker open requested: locker={} signer={:?}", locker, request.signer);

        let result = self.verify(request).await;
        if let Err(e) = &result {
            warn!("Locker {} open refused for {:?}: {}", locker, request.signer, e);
            increment_counter!("relay_locker_open_total", "outcome" => e.kind());
        }
        result?;

        let tx_hash = self.chain.open_locker(locker, &request.signature).await?;
        increment_counter!("relay_locker_open_total", "outcome" => "submitted");
        info!("Locker {} opened for {:?}: {:?}", locker, request.signer, tx_hash);
        Ok(tx_hash)
    }

    async fn verify(&self, request: &LockerOpenRequest) -> RelayResult<()> {
        let assignee = self.chain.locker_assignee(request.locker_number).await?;
        check_assignee(request.locker_number, assignee, request.signer)?;
        verify_locker_signature(
            request.locker_number,
            request.signer,
            &request.signature,
            request.message_hash,
        )?;
        Ok(())
    }
}
