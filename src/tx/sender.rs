//! Local-key transaction signer with retry and receipt tracking

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use crate::chain::{Call, ChainManager, ChainProvider, GasPrice, ReceiptLog, TransactionSigner, TxReceipt};
use crate::config::SignerConfig;
use crate::error::{RebalancerError, RebalancerResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Signs with a single local key and broadcasts over the chain providers
pub struct EvmTransactionSigner {
    chains: Arc<ChainManager>,
    nonces: NonceManager,
    gas: GasEstimator,
    wallet: LocalWallet,
    config: SignerConfig,
}

impl EvmTransactionSigner {
    pub fn new(chains: Arc<ChainManager>, config: SignerConfig) -> RebalancerResult<Self> {
        let wallet = Self::load_wallet(&config.private_key_env)?;
        info!("Transaction signer initialized with wallet: {:?}", wallet.address());

        Ok(Self {
            chains,
            nonces: NonceManager::new(),
            gas: GasEstimator::new(),
            wallet,
            config,
        })
    }

    /// Load wallet from the configured environment variable
    fn load_wallet(env_var: &str) -> RebalancerResult<LocalWallet> {
        let key = std::env::var(env_var).map_err(|_| {
            RebalancerError::Wallet(format!("No wallet configured. Set {}", env_var))
        })?;
        key.trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| RebalancerError::Wallet(format!("Invalid private key: {}", e)))
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    async fn is_confirmed(&self, provider: &ChainProvider, block: u64) -> bool {
        let depth = provider.confirmation_blocks();
        if depth <= 1 {
            return true;
        }
        match provider.get_block_number().await {
            Ok(current) => current + 1 >= block + depth,
            Err(e) => {
                warn!("Block number lookup on chain {} failed: {}", provider.chain_id(), e);
                false
            }
        }
    }

    async fn submit_call(&self, provider: &ChainProvider, call: &Call) -> RebalancerResult<H256> {
        let chain_id = provider.chain_id();
        let from = self.wallet.address();

        let estimate_tx: TypedTransaction = TransactionRequest::new()
            .from(from)
            .to(call.to)
            .data(call.data.clone())
            .value(call.value)
            .into();
        let gas_limit = self.gas.estimate_gas_limit(provider, &estimate_tx).await?;
        let gas_price = self.gas.get_gas_price(provider).await?;

        let need = GasEstimator::max_cost(gas_limit, &gas_price, call.value);
        let have = provider.get_native_balance(from).await?;
        if have < need {
            return Err(RebalancerError::InsufficientBalance {
                chain_id,
                have: have.to_string(),
                need: need.to_string(),
            });
        }

        let nonce = self.nonces.get_nonce(from, provider).await?;
        let tx = build_tx(call, chain_id, nonce, gas_limit, &gas_price);

        match self.send_with_retry(provider, tx).await {
            Ok(tx_hash) => {
                self.nonces
                    .mark_pending(from, chain_id, nonce, &format!("{:?}", tx_hash))
                    .await;
                crate::metrics::record_tx_submitted(chain_id);
                Ok(tx_hash)
            }
            Err(e) => {
                self.nonces.release_nonce(from, chain_id, nonce).await;
                crate::metrics::record_tx_failed(chain_id);
                Err(e)
            }
        }
    }

    /// Send transaction with retry logic
    async fn send_with_retry(&self, provider: &ChainProvider, tx: TypedTransaction) -> RebalancerResult<H256> {
        let chain_id = provider.chain_id();
        let wallet = self.wallet.clone().with_chain_id(chain_id);
        let max_attempts = self.config.max_retries.max(1);

        let mut attempts = 0;
        let mut last_error = None;

        while attempts < max_attempts {
            attempts += 1;

            let signed_tx = match wallet.sign_transaction(&tx).await {
                Ok(sig) => tx.rlp_signed(&sig),
                Err(e) => {
                    error!("Failed to sign transaction: {}", e);
                    return Err(RebalancerError::Wallet(e.to_string()));
                }
            };

            let send_timeout = Duration::from_secs(self.config.send_timeout_secs);
            let result = timeout(send_timeout, provider.http().send_raw_transaction(signed_tx)).await;

            match result {
                Ok(Ok(pending_tx)) => {
                    let tx_hash = pending_tx.tx_hash();
                    info!(
                        "Transaction sent on chain {}: {:?} (attempt {}/{})",
                        chain_id, tx_hash, attempts, max_attempts
                    );
                    return Ok(tx_hash);
                }
                Ok(Err(e)) => {
                    let error_msg = e.to_string();

                    if error_msg.contains("nonce too low") {
                        warn!("Nonce too low on chain {}, syncing", chain_id);
                        self.nonces.sync(self.wallet.address(), provider).await?;
                        return Err(RebalancerError::Nonce {
                            chain_id,
                            message: "Nonce too low".to_string(),
                        });
                    } else if error_msg.contains("insufficient funds") {
                        return Err(RebalancerError::InsufficientBalance {
                            chain_id,
                            have: "unknown".to_string(),
                            need: "gas".to_string(),
                        });
                    }

                    warn!("Send failed on chain {}: {}", chain_id, error_msg);
                    last_error = Some(RebalancerError::Transaction(error_msg));
                }
                Err(_) => {
                    warn!("Transaction send timeout (attempt {})", attempts);
                    last_error = Some(RebalancerError::Timeout {
                        operation: "send transaction".to_string(),
                    });
                }
            }

            if attempts < max_attempts {
                tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| RebalancerError::Transaction("Unknown error".to_string())))
    }
}

fn build_tx(call: &Call, chain_id: u64, nonce: u64, gas_limit: U256, gas_price: &GasPrice) -> TypedTransaction {
    match gas_price {
        GasPrice::Legacy(price) => TransactionRequest::new()
            .to(call.to)
            .data(call.data.clone())
            .value(call.value)
            .nonce(nonce)
            .gas(gas_limit)
            .gas_price(*price)
            .chain_id(chain_id)
            .into(),
        GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => Eip1559TransactionRequest::new()
            .to(call.to)
            .data(call.data.clone())
            .value(call.value)
            .nonce(nonce)
            .gas(gas_limit)
            .max_fee_per_gas(*max_fee_per_gas)
            .max_priority_fee_per_gas(*max_priority_fee_per_gas)
            .chain_id(chain_id)
            .into(),
    }
}

fn to_receipt(receipt: TransactionReceipt) -> TxReceipt {
    TxReceipt {
        tx_hash: receipt.transaction_hash,
        block_number: receipt.block_number.map(|b| b.as_u64()).unwrap_or_default(),
        success: receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false),
        logs: receipt
            .logs
            .into_iter()
            .map(|log| ReceiptLog {
                address: log.address,
                topics: log.topics,
                data: log.data,
            })
            .collect(),
    }
}

#[async_trait]
impl TransactionSigner for EvmTransactionSigner {
    async fn submit(&self, chain_id: u64, wallet: Address, calls: Vec<Call>) -> RebalancerResult<H256> {
        if wallet != self.wallet.address() {
            return Err(RebalancerError::Wallet(format!(
                "Signer holds {:?}, asked to sign for {:?}",
                self.wallet.address(),
                wallet
            )));
        }
        let provider = self.chains.get_provider(chain_id)?;

        let total = calls.len();
        let mut last = None;
        for (i, call) in calls.iter().enumerate() {
            let tx_hash = self.submit_call(&provider, call).await?;
            // later calls may depend on this one's state (approve before transfer)
            if i + 1 < total {
                let receipt = self.wait_for_receipt(chain_id, tx_hash).await?;
                if !receipt.success {
                    return Err(RebalancerError::Reverted {
                        chain_id,
                        tx_hash: format!("{:?}", tx_hash),
                    });
                }
            }
            last = Some(tx_hash);
        }

        last.ok_or_else(|| RebalancerError::Transaction("No calls to submit".to_string()))
    }

    async fn wait_for_receipt(&self, chain_id: u64, tx_hash: H256) -> RebalancerResult<TxReceipt> {
        let provider = self.chains.get_provider(chain_id)?;
        let deadline = Instant::now() + Duration::from_secs(self.config.receipt_timeout_secs);
        let poll = Duration::from_millis(self.config.receipt_poll_ms);

        loop {
            match provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) if receipt.block_number.is_some() => {
                    let receipt = to_receipt(receipt);
                    if !self.is_confirmed(&provider, receipt.block_number).await {
                        if Instant::now() >= deadline {
                            return Err(RebalancerError::Timeout {
                                operation: format!("confirmations for {:?} on chain {}", tx_hash, chain_id),
                            });
                        }
                        tokio::time::sleep(poll).await;
                        continue;
                    }
                    self.nonces
                        .confirm_tx(self.wallet.address(), chain_id, &format!("{:?}", tx_hash))
                        .await;
                    debug!(
                        "Receipt for {:?} on chain {}: block {}, success {}",
                        tx_hash, chain_id, receipt.block_number, receipt.success
                    );
                    return Ok(receipt);
                }
                Ok(_) => {}
                Err(e) => warn!("Receipt lookup for {:?} failed: {}", tx_hash, e),
            }

            if Instant::now() >= deadline {
                return Err(RebalancerError::Timeout {
                    operation: format!("receipt for {:?} on chain {}", tx_hash, chain_id),
                });
            }
            tokio::time::sleep(poll).await;
        }
    }
}
