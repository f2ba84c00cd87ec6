//! Minimal calldata helpers

use ethers::abi::{self, Token};
use ethers::types::{Bytes, H256};
use sha3::{Digest, Keccak256};

pub fn keccak256(data: impl AsRef<[u8]>) -> H256 {
    H256::from_slice(&Keccak256::digest(data.as_ref()))
}

/// First four bytes of the keccak hash of a function signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash.as_bytes()[..4]);
    out
}

/// Event topic for a signature such as `MessageSent(bytes)`
pub fn event_topic(signature: &str) -> H256 {
    keccak256(signature.as_bytes())
}

/// `selector(signature) ++ abi.encode(args)`
pub fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = selector(signature).to_vec();
    data.extend(abi::encode(args));
    data.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, U256};

    #[test]
    fn test_known_selectors() {
        assert_eq!(selector("balanceOf(address)"), [0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(selector("approve(address,uint256)"), [0x09, 0x5e, 0xa7, 0xb3]);
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn test_encode_call_layout() {
        let spender = Address::repeat_byte(0x11);
        let data = encode_call(
            "approve(address,uint256)",
            &[Token::Address(spender), Token::Uint(U256::from(5u64))],
        );
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[16..36], spender.as_bytes());
        assert_eq!(data[67], 5);
    }
}
