//! Test helpers: chain/mailer mocks and deterministic wallets

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, TxHash, U256};
use mockall::mock;

use crate::chain::VendorChain;
use crate::error::RelayResult;
use crate::notifications::{EmailTemplate, Mailer};
use crate::signature::locker_digest;
use crate::types::{LockerNumber, LockerSignature, PermitRequest, TxStatus};

// Hardhat/anvil default accounts #1 and #2
const BUYER_KEY: &str = "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
const OTHER_KEY: &str = "5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a";

mock! {
    pub Chain {}

    #[async_trait]
    impl VendorChain for Chain {
        async fn pull_approved_tokens(&self, buyer: Address, amount: U256) -> RelayResult<TxHash>;
        async fn reserve_locker(&self, buyer: Address) -> RelayResult<TxHash>;
        async fn locker_assignee(&self, locker: LockerNumber) -> RelayResult<Address>;
        async fn open_locker(&self, locker: LockerNumber, signature: &LockerSignature) -> RelayResult<TxHash>;
        async fn submit_permit(&self, permit: &PermitRequest) -> RelayResult<TxHash>;
        async fn transaction_status(&self, tx_hash: TxHash) -> RelayResult<TxStatus>;
    }
}

mock! {
    pub Mail {}

    #[async_trait]
    impl Mailer for Mail {
        async fn send(&self, to: &str, template: &EmailTemplate) -> RelayResult<()>;
    }
}

pub fn buyer_wallet() -> LocalWallet {
    BUYER_KEY.parse().expect("valid test key")
}

pub fn other_wallet() -> LocalWallet {
    OTHER_KEY.parse().expect("valid test key")
}

/// Sign a locker number the way a buyer's wallet does (`personal_sign` over the packed digest)
pub async fn sign_locker(wallet: &LocalWallet, locker: LockerNumber) -> LockerSignature {
    let sig = wallet
        .sign_message(locker_digest(locker).as_bytes())
        .await
        .expect("signing succeeds");
    LockerSignature::try_from(sig).expect("v fits in a byte")
}
