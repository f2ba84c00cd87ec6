//! Transaction submission: nonce management, gas pricing, signing and
//! per-wallet serialization

mod gas;
mod gated;
mod nonce;
mod sender;

pub use gas::GasEstimator;
pub use gated::WalletGatedSigner;
pub use nonce::NonceManager;
pub use sender::EvmTransactionSigner;
