//! Circle CCTP (v1) burn-and-mint for USDC
//!
//! Burns on the source chain through `TokenMessenger.depositForBurn`, waits for
//! Circle's attestation of the emitted `MessageSent` message, then mints on the
//! destination with `MessageTransmitter.receiveMessage`.

use super::{ProviderExecution, RebalanceProvider};
use crate::chain::abi::{encode_call, event_topic, keccak256};
use crate::chain::{Call, TransactionSigner, TxReceipt};
use crate::config::CctpConfig;
use crate::error::{RebalancerError, RebalancerResult};
use crate::rebalance::types::{AttestationRecord, RebalanceQuote, SettlementHandle, Strategy, TokenRef};

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, U256};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const MESSAGE_SENT: &str = "MessageSent(bytes)";
const ATTESTATION_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct CctpChain {
    domain: u32,
    usdc: Address,
    token_messenger: Address,
    message_transmitter: Address,
}

#[derive(Debug, Deserialize)]
struct AttestationResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    attestation: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct CctpProvider {
    client: reqwest::Client,
    api_url: String,
    chains: HashMap<u64, CctpChain>,
}

impl CctpProvider {
    pub fn new(config: &CctpConfig) -> RebalancerResult<Self> {
        let mut chains = HashMap::new();
        for chain in &config.chains {
            chains.insert(
                chain.chain_id,
                CctpChain {
                    domain: chain.domain,
                    usdc: parse_address(&chain.usdc)?,
                    token_messenger: parse_address(&chain.token_messenger)?,
                    message_transmitter: parse_address(&chain.message_transmitter)?,
                },
            );
        }

        let client = reqwest::Client::builder()
            .timeout(ATTESTATION_REQUEST_TIMEOUT)
            .build()?;

        info!("CCTP provider configured for chains {:?}", chains.keys().collect::<Vec<_>>());
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            chains,
        })
    }

    fn chain(&self, chain_id: u64) -> RebalancerResult<&CctpChain> {
        self.chains.get(&chain_id).ok_or_else(|| self.error(format!("chain {} not configured", chain_id)))
    }

    fn error(&self, message: impl Into<String>) -> RebalancerError {
        RebalancerError::Provider {
            strategy: Strategy::Cctp,
            message: message.into(),
        }
    }

    fn is_usdc(&self, token: &TokenRef) -> bool {
        self.chains
            .get(&token.chain_id)
            .map(|c| c.usdc == token.address)
            .unwrap_or(false)
    }

    /// Bytes of the `MessageSent` event the transmitter emitted in `receipt`
    fn extract_message(&self, source: &CctpChain, receipt: &TxReceipt) -> RebalancerResult<Vec<u8>> {
        let topic = event_topic(MESSAGE_SENT);
        let log = receipt
            .logs
            .iter()
            .find(|log| log.address == source.message_transmitter && log.topics.first() == Some(&topic))
            .ok_or_else(|| self.error(format!("no MessageSent log in {:?}", receipt.tx_hash)))?;

        match abi::decode(&[ParamType::Bytes], &log.data) {
            Ok(tokens) => match tokens.into_iter().next() {
                Some(Token::Bytes(message)) => Ok(message),
                _ => Err(self.error("MessageSent carried no bytes")),
            },
            Err(e) => Err(self.error(format!("undecodable MessageSent: {}", e))),
        }
    }
}

fn parse_address(value: &str) -> RebalancerResult<Address> {
    Address::from_str(value).map_err(|e| RebalancerError::Config(format!("Invalid CCTP address {}: {}", value, e)))
}

/// Left-pad an EVM address into CCTP's bytes32 recipient
fn address_to_bytes32(address: Address) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(address.as_bytes());
    out
}

#[async_trait]
impl RebalanceProvider for CctpProvider {
    fn strategy(&self) -> Strategy {
        Strategy::Cctp
    }

    fn is_async(&self) -> bool {
        true
    }

    fn supports(&self, token_in: &TokenRef, token_out: &TokenRef) -> bool {
        token_in.chain_id != token_out.chain_id && self.is_usdc(token_in) && self.is_usdc(token_out)
    }

    async fn quote(
        &self,
        token_in: &TokenRef,
        token_out: &TokenRef,
        amount: U256,
    ) -> RebalancerResult<Vec<RebalanceQuote>> {
        if !self.supports(token_in, token_out) {
            return Err(self.error(format!("unsupported route {} -> {}", token_in, token_out)));
        }
        let destination = self.chain(token_out.chain_id)?;
        Ok(vec![RebalanceQuote::new(
            Strategy::Cctp,
            *token_in,
            *token_out,
            amount,
            amount,
            json!({ "destinationDomain": destination.domain }),
        )])
    }

    async fn execute(
        &self,
        signer: &dyn TransactionSigner,
        wallet: Address,
        quote: &RebalanceQuote,
    ) -> RebalancerResult<ProviderExecution> {
        let source_chain_id = quote.token_in.chain_id;
        let destination_chain_id = quote.token_out.chain_id;
        let source = self.chain(source_chain_id)?;
        let destination = self.chain(destination_chain_id)?;

        let approve = Call::new(
            source.usdc,
            encode_call(
                "approve(address,uint256)",
                &[Token::Address(source.token_messenger), Token::Uint(quote.amount_in)],
            ),
        );
        let burn = Call::new(
            source.token_messenger,
            encode_call(
                "depositForBurn(uint256,uint32,bytes32,address)",
                &[
                    Token::Uint(quote.amount_in),
                    Token::Uint(U256::from(destination.domain)),
                    Token::FixedBytes(address_to_bytes32(wallet).to_vec()),
                    Token::Address(source.usdc),
                ],
            ),
        );

        let tx_hash = signer.submit(source_chain_id, wallet, vec![approve, burn]).await?;
        let receipt = signer.wait_for_receipt(source_chain_id, tx_hash).await?;
        if !receipt.success {
            return Err(RebalancerError::Reverted {
                chain_id: source_chain_id,
                tx_hash: format!("{:?}", tx_hash),
            });
        }

        let message = self.extract_message(source, &receipt)?;
        let message_hash = keccak256(&message);
        info!(
            "CCTP burn of {} on chain {} for domain {}: message {:?}",
            quote.amount_in, source_chain_id, destination.domain, message_hash
        );

        Ok(ProviderExecution {
            tx_hash,
            settlement: Some(SettlementHandle {
                id: format!("{:?}", message_hash),
                source_chain_id,
                destination_chain_id,
                source_tx_hash: tx_hash,
                data: json!({ "message": Bytes::from(message) }),
            }),
        })
    }

    async fn check_settlement(&self, handle: &SettlementHandle) -> RebalancerResult<AttestationRecord> {
        let url = format!("{}/v1/attestations/{}", self.api_url, handle.id);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!("CCTP attestation request for {} timed out", handle.id);
                return Ok(AttestationRecord::pending(&handle.id));
            }
            Err(e) => return Err(e.into()),
        };

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("Attestation for {} not indexed yet", handle.id);
            return Ok(AttestationRecord::pending(&handle.id));
        }
        if !response.status().is_success() {
            return Err(self.error(format!(
                "attestation API request failed with status {}",
                response.status()
            )));
        }

        let body: AttestationResponse = response.json().await?;
        if let Some(error) = body.error {
            debug!("Attestation API reports '{}' for {}", error, handle.id);
            return Ok(AttestationRecord::pending(&handle.id));
        }

        match (body.status.as_deref(), body.attestation) {
            (Some("complete"), Some(attestation)) => {
                let attestation = Bytes::from_str(&attestation)
                    .map_err(|e| self.error(format!("malformed attestation: {}", e)))?;
                Ok(AttestationRecord::complete(&handle.id, Some(attestation)))
            }
            (status, _) => {
                debug!("Attestation for {} is {:?}", handle.id, status);
                Ok(AttestationRecord::pending(&handle.id))
            }
        }
    }

    async fn finalize(
        &self,
        _wallet: Address,
        handle: &SettlementHandle,
        record: &AttestationRecord,
    ) -> RebalancerResult<Vec<Call>> {
        let destination = self.chain(handle.destination_chain_id)?;
        let message: Bytes = handle
            .data
            .get("message")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .ok_or_else(|| self.error(format!("handle {} carries no message", handle.id)))?;
        let attestation = record
            .attestation
            .clone()
            .ok_or_else(|| self.error(format!("no attestation for {}", handle.id)))?;

        Ok(vec![Call::new(
            destination.message_transmitter,
            encode_call(
                "receiveMessage(bytes,bytes)",
                &[Token::Bytes(message.to_vec()), Token::Bytes(attestation.to_vec())],
            ),
        )])
    }
}
