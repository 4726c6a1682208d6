//! Chain client for the potato vendor contract
//!
//! Everything the relay asks of the chain goes through [`VendorChain`]:
//! pulling approved payment tokens, reserving and opening lockers, reading
//! the locker assignment, submitting permits and checking receipts.
//! [`EthVendorClient`] implements it over an ethers HTTP provider, signing
//! writes with the relay's operator key.
//!
//! Mỗi call đều có timeout riêng để một node treo không chặn cả vòng drain.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::abi::{parse_abi, Abi};
use ethers::contract::Contract;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, BlockNumber, Filter, Log, TxHash, ValueOrArray, H256, U256, U64};
use tracing::{debug, info, warn};

use crate::config::ChainConfig;
use crate::error::{RelayError, RelayResult};
use crate::listener::VendorLogSource;
use crate::types::{LockerNumber, LockerSignature, PermitRequest, TxStatus};

/// Human-readable ABI of the parts of the vendor contract the relay touches
pub const VENDOR_ABI: &[&str] = &[
    "function getApprovedAmount(address buyer, uint256 amount)",
    "function reserveLocker(address buyer) returns (uint8)",
    "function _lockerToBuyer(uint8 lockerNumber) view returns (address)",
    "function openLocker(uint8 lockerNumber, uint8 v, bytes32 r, bytes32 s)",
    "function permit(address owner, address spender, uint256 value, uint256 deadline, uint8 v, bytes32 r, bytes32 s, string email)",
    "event Purchase(address indexed buyer, uint256 amount, string email)",
    "event LockerAssigned(address indexed buyer, uint8 lockerNumber)",
    "event LockerOpened(address indexed buyer, uint8 lockerNumber)",
];

/// Parse [`VENDOR_ABI`]
pub fn vendor_abi() -> RelayResult<Abi> {
    parse_abi(VENDOR_ABI).map_err(|e| RelayError::Config(format!("Invalid vendor ABI: {}", e)))
}

/// Calls into the vendor contract
#[async_trait]
pub trait VendorChain: Send + Sync {
    /// Move `amount` of the buyer's approved tokens to the vendor; waits for confirmation
    async fn pull_approved_tokens(&self, buyer: Address, amount: U256) -> RelayResult<TxHash>;

    /// Reserve the next free locker for `buyer`; waits for confirmation.
    /// Reverts when all 256 lockers are taken.
    async fn reserve_locker(&self, buyer: Address) -> RelayResult<TxHash>;

    /// Current assignee of a locker, zero address when free
    async fn locker_assignee(&self, locker: LockerNumber) -> RelayResult<Address>;

    /// Submit `openLocker` with the operator key; returns once the transaction is accepted
    async fn open_locker(&self, locker: LockerNumber, signature: &LockerSignature) -> RelayResult<TxHash>;

    /// Submit a buyer-signed permit with the operator key
    async fn submit_permit(&self, permit: &PermitRequest) -> RelayResult<TxHash>;

    /// Receipt-based status of a transaction
    async fn transaction_status(&self, tx_hash: TxHash) -> RelayResult<TxStatus>;
}

type OperatorClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Ethers-backed [`VendorChain`]
pub struct EthVendorClient {
    /// Read-only provider, also used for logs and receipts
    provider: Arc<Provider<Http>>,
    /// Vendor contract bound to the operator signer
    vendor: Contract<OperatorClient>,
    /// Vendor contract address
    vendor_address: Address,
    /// Operator address, for logs
    operator: Address,
    /// Confirmations to wait for on relay-side writes
    confirmations: usize,
    /// Upper bound for any single chain call
    call_timeout: Duration,
}

impl EthVendorClient {
    /// Connect to the configured node and bind the vendor contract to the operator key
    ///
    /// # Errors
    /// * `Config` if the RPC URL or key is invalid, or the node reports a different chain id
    /// * `ChainCallFailed` if the node cannot be reached
    pub async fn connect(config: &ChainConfig, operator_key: &str) -> RelayResult<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| RelayError::Config(format!("Invalid RPC URL {}: {}", config.rpc_url, e)))?
            .interval(Duration::from_millis(config.poll_interval_ms));

        let call_timeout = Duration::from_secs(config.call_timeout_secs);
        let node_chain_id = with_timeout("eth_chainId", call_timeout, provider.get_chainid())
            .await?
            .as_u64();
        if node_chain_id != config.chain_id {
            return Err(RelayError::Config(format!(
                "Node at {} reports chain id {}, expected {} ({})",
                config.rpc_url, node_chain_id, config.chain_id, config.name
            )));
        }

        let wallet = operator_key
            .trim()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| RelayError::Config(format!("Invalid operator key: {}", e)))?
            .with_chain_id(node_chain_id);
        let operator = wallet.address();

        let client = Arc::new(SignerMiddleware::new(provider.clone(), wallet));
        let vendor = Contract::new(config.vendor_address, vendor_abi()?, client);

        info!(
            "Connected to {} (chain {}), vendor {:?}, operator {:?}",
            config.name, node_chain_id, config.vendor_address, operator
        );

        Ok(Self {
            provider: Arc::new(provider),
            vendor,
            vendor_address: config.vendor_address,
            operator,
            confirmations: config.confirmations,
            call_timeout,
        })
    }

    /// Operator address writes are signed with
    pub fn operator(&self) -> Address {
        self.operator
    }

    /// Latest block number, used by `test-chain`
    pub async fn block_number(&self) -> RelayResult<u64> {
        with_timeout("eth_blockNumber", self.call_timeout, self.provider.get_block_number())
            .await
            .map(|n| n.as_u64())
    }

    /// Send a write and wait for its receipt; a missing or failed receipt is a revert
    async fn send_and_confirm(
        &self,
        operation: &'static str,
        call: ethers::contract::ContractCall<OperatorClient, ()>,
    ) -> RelayResult<TxHash> {
        let fut = async {
            let pending = call.send().await.map_err(|e| RelayError::chain(operation, e))?;
            let tx_hash = pending.tx_hash();
            debug!("{} submitted: {:?}", operation, tx_hash);

            let receipt = pending
                .confirmations(self.confirmations)
                .await
                .map_err(|e| RelayError::chain(operation, e))?
                .ok_or_else(|| RelayError::chain(operation, "transaction dropped from mempool"))?;

            if receipt.status != Some(U64::one()) {
                return Err(RelayError::chain(operation, format!("transaction {:?} reverted", tx_hash)));
            }
            Ok::<_, RelayError>(tx_hash)
        };

        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::chain(
                operation,
                format!("timed out after {}s", self.call_timeout.as_secs()),
            )),
        }
    }

    /// Build a write call with no decoded return value
    fn write_call<T: ethers::abi::Tokenize>(
        &self,
        operation: &'static str,
        function: &str,
        args: T,
    ) -> RelayResult<ethers::contract::ContractCall<OperatorClient, ()>> {
        self.vendor
            .method::<_, ()>(function, args)
            .map_err(|e| RelayError::chain(operation, e))
    }

    /// Submit a write without waiting for it to be mined
    async fn submit(
        &self,
        operation: &'static str,
        call: ethers::contract::ContractCall<OperatorClient, ()>,
    ) -> RelayResult<TxHash> {
        let fut = async {
            let pending = call.send().await.map_err(|e| RelayError::chain(operation, e))?;
            Ok::<_, RelayError>(pending.tx_hash())
        };
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::chain(
                operation,
                format!("timed out after {}s", self.call_timeout.as_secs()),
            )),
        }
    }
}

#[async_trait]
impl VendorChain for EthVendorClient {
    async fn pull_approved_tokens(&self, buyer: Address, amount: U256) -> RelayResult<TxHash> {
        let call = self.write_call("getApprovedAmount", "getApprovedAmount", (buyer, amount))?;
        self.send_and_confirm("getApprovedAmount", call).await
    }

    async fn reserve_locker(&self, buyer: Address) -> RelayResult<TxHash> {
        let call = self.write_call("reserveLocker", "reserveLocker", buyer)?;
        self.send_and_confirm("reserveLocker", call).await
    }

    async fn locker_assignee(&self, locker: LockerNumber) -> RelayResult<Address> {
        let call = self
            .vendor
            .method::<_, Address>("_lockerToBuyer", locker)
            .map_err(|e| RelayError::chain("_lockerToBuyer", e))?;
        with_timeout("_lockerToBuyer", self.call_timeout, call.call()).await
    }

    async fn open_locker(&self, locker: LockerNumber, signature: &LockerSignature) -> RelayResult<TxHash> {
        let call = self.write_call(
            "openLocker",
            "openLocker",
            (locker, signature.v, signature.r, signature.s),
        )?;
        let tx_hash = self.submit("openLocker", call).await?;
        info!("openLocker({}) sent by operator {:?}: {:?}", locker, self.operator, tx_hash);
        Ok(tx_hash)
    }

    async fn submit_permit(&self, permit: &PermitRequest) -> RelayResult<TxHash> {
        let call = self.write_call(
            "permit",
            "permit",
            (
                permit.owner,
                permit.spender,
                permit.value,
                permit.deadline,
                permit.signature.v,
                permit.signature.r,
                permit.signature.s,
                permit.email.clone(),
            ),
        )?;
        let tx_hash = self.submit("permit", call).await?;
        info!("permit for owner {:?} sent: {:?}", permit.owner, tx_hash);
        Ok(tx_hash)
    }

    async fn transaction_status(&self, tx_hash: TxHash) -> RelayResult<TxStatus> {
        let receipt = with_timeout(
            "eth_getTransactionReceipt",
            self.call_timeout,
            self.provider.get_transaction_receipt(tx_hash),
        )
        .await?;

        Ok(match receipt {
            None => TxStatus::Pending,
            Some(r) if r.status == Some(U64::one()) => TxStatus::Success,
            Some(_) => TxStatus::Error,
        })
    }
}

#[async_trait]
impl VendorLogSource for EthVendorClient {
    async fn latest_block(&self) -> RelayResult<u64> {
        self.block_number().await
    }

    async fn vendor_logs(&self, topics: &[H256], from_block: u64, to_block: u64) -> RelayResult<Vec<Log>> {
        let filter = Filter::new()
            .address(self.vendor_address)
            .topic0(ValueOrArray::Array(topics.iter().copied().map(Some).collect()))
            .from_block(BlockNumber::Number(from_block.into()))
            .to_block(BlockNumber::Number(to_block.into()));

        let logs = with_timeout("eth_getLogs", self.call_timeout, self.provider.get_logs(&filter)).await?;
        if logs.iter().any(|l| l.removed == Some(true)) {
            warn!("Node returned removed logs between blocks {} and {}", from_block, to_block);
        }
        Ok(logs.into_iter().filter(|l| l.removed != Some(true)).collect())
    }
}

/// Await a chain future with an upper bound, mapping both failure kinds to `ChainCallFailed`
async fn with_timeout<T, E, F>(operation: &'static str, limit: Duration, fut: F) -> RelayResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RelayError::chain(operation, e)),
        Err(_) => Err(RelayError::chain(
            operation,
            format!("timed out after {}s", limit.as_secs()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_abi_parses() {
        let abi = vendor_abi().unwrap();
        for function in ["getApprovedAmount", "reserveLocker", "_lockerToBuyer", "openLocker", "permit"] {
            assert!(abi.function(function).is_ok(), "missing function {}", function);
        }
        for event in ["Purchase", "LockerAssigned", "LockerOpened"] {
            assert!(abi.event(event).is_ok(), "missing event {}", event);
        }
    }

    #[test]
    fn test_open_locker_signature_types() {
        let abi = vendor_abi().unwrap();
        let open = abi.function("openLocker").unwrap();
        assert_eq!(open.signature(), "openLocker(uint8,uint8,bytes32,bytes32)");
        let read = abi.function("_lockerToBuyer").unwrap();
        assert_eq!(read.inputs[0].kind, ethers::abi::ParamType::Uint(8));
        assert_eq!(read.outputs[0].kind, ethers::abi::ParamType::Address);
    }

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed_to_chain_error() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<u64, String>(1)
        };
        let err = with_timeout("eth_blockNumber", Duration::from_millis(10), slow)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "chain_call_failed");
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_with_timeout_maps_inner_error() {
        let failing = async { Err::<u64, String>("connection refused".into()) };
        let err = with_timeout("eth_chainId", Duration::from_secs(1), failing)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }
}
