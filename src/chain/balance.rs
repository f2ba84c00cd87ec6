//! Balance reader over the chain providers

use super::abi::encode_call;
use super::{BalanceReader, ChainManager};
use crate::error::{RebalancerError, RebalancerResult};

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionRequest, U256};
use std::sync::Arc;
use tracing::debug;

/// `balanceOf` for ERC-20s, `eth_getBalance` for the zero address
pub struct EvmBalanceReader {
    chains: Arc<ChainManager>,
}

impl EvmBalanceReader {
    pub fn new(chains: Arc<ChainManager>) -> Self {
        Self { chains }
    }
}

#[async_trait]
impl BalanceReader for EvmBalanceReader {
    async fn get_balance(&self, chain_id: u64, token: Address, wallet: Address) -> RebalancerResult<U256> {
        let provider = self.chains.get_provider(chain_id)?;

        if token == Address::zero() {
            return provider.get_native_balance(wallet).await;
        }

        let data = encode_call("balanceOf(address)", &[Token::Address(wallet)]);
        let tx: TypedTransaction = TransactionRequest::new().to(token).data(data).into();
        let out = provider.call(&tx).await?;

        if out.len() < 32 {
            return Err(RebalancerError::ChainConnection {
                chain_id,
                message: format!("balanceOf on {:?} returned {} bytes", token, out.len()),
            });
        }
        let balance = U256::from_big_endian(&out[..32]);
        debug!("Balance of {:?} on {}:{:?} is {}", wallet, chain_id, token, balance);
        Ok(balance)
    }
}
