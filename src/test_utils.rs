use crate::chain::{ChainClient, FeeEstimate, FeeHistory};
use crate::error::CoordinatorResult;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Transaction, TransactionReceipt, H256, U256, U64};

mockall::mock! {
    pub Chain {}

    #[async_trait]
    impl ChainClient for Chain {
        fn chain_id(&self) -> u64;

        async fn get_pending_nonce(&self, address: Address) -> CoordinatorResult<u64>;

        async fn get_fee_history(
            &self,
            block_count: u64,
            percentiles: &[f64],
        ) -> CoordinatorResult<FeeHistory>;

        async fn get_fee_estimate(&self) -> CoordinatorResult<FeeEstimate>;

        async fn estimate_gas(&self, tx: &TypedTransaction) -> CoordinatorResult<U256>;

        async fn send_transaction(&self, tx: &TypedTransaction) -> CoordinatorResult<H256>;

        async fn get_receipt(&self, tx_hash: H256) -> CoordinatorResult<Option<TransactionReceipt>>;

        async fn get_mempool_tx(&self, tx_hash: H256) -> CoordinatorResult<Option<Transaction>>;
    }
}

pub fn gwei(v: u64) -> U256 {
    U256::from(v) * U256::exp10(9)
}

pub fn wallet() -> Address {
    "0xAbCdEf0123456789aBcDeF0123456789AbCdEf01"
        .parse()
        .unwrap()
}

pub fn hash(n: u64) -> H256 {
    H256::from_low_u64_be(n)
}

pub fn receipt(tx_hash: H256, success: bool) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: tx_hash,
        block_number: Some(U64::from(100)),
        status: Some(U64::from(u64::from(success))),
        ..Default::default()
    }
}
