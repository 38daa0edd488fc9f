//! Base58Check address encoding.
//!
//! An address is `base58(version || hash || checksum)` where `hash` is the
//! 32-byte key id or script hash and `checksum` is the first four bytes of
//! double SHA-256 over `version || hash`. The version byte selects both the
//! network and the destination kind.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::AddressError;
use crate::script::{Destination, Script};
use crate::types::Hash256;

const PAYLOAD_LEN: usize = 1 + 32;
const CHECKSUM_LEN: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn key_version(&self) -> u8 {
        match self {
            Network::Mainnet => 62,
            Network::Testnet => 111,
        }
    }

    pub fn script_version(&self) -> u8 {
        match self {
            Network::Mainnet => 85,
            Network::Testnet => 196,
        }
    }

    fn classify(version: u8) -> Result<(Network, bool), AddressError> {
        for net in [Network::Mainnet, Network::Testnet] {
            if version == net.key_version() {
                return Ok((net, false));
            }
            if version == net.script_version() {
                return Ok((net, true));
            }
        }
        Err(AddressError::UnknownVersion(version))
    }
}

/// A network-tagged destination with a Base58Check text form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    network: Network,
    destination: Destination,
}

impl PartialOrd for Network {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Network {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key_version().cmp(&other.key_version())
    }
}

impl Address {
    pub fn new(destination: Destination, network: Network) -> Self {
        Self { network, destination }
    }

    /// Address of the destination a script pays to.
    pub fn from_script(script: &Script, network: Network) -> Result<Self, AddressError> {
        let destination = script.destination().ok_or(AddressError::NoDestination)?;
        Ok(Self::new(destination, network))
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    pub fn script_pubkey(&self) -> Script {
        Script::from_destination(&self.destination)
    }

    fn version(&self) -> u8 {
        match self.destination {
            Destination::KeyHash(_) => self.network.key_version(),
            Destination::ScriptHash(_) => self.network.script_version(),
        }
    }

    pub fn encode(&self) -> String {
        let mut data = Vec::with_capacity(PAYLOAD_LEN + CHECKSUM_LEN);
        data.push(self.version());
        data.extend_from_slice(self.destination.hash().as_bytes());
        let check = checksum(&data);
        data.extend_from_slice(&check);
        bs58::encode(data).into_string()
    }

    pub fn decode(s: &str) -> Result<Self, AddressError> {
        let data = bs58::decode(s)
            .into_vec()
            .map_err(|_| AddressError::InvalidBase58)?;
        if data.len() != PAYLOAD_LEN + CHECKSUM_LEN {
            return Err(AddressError::InvalidLength(data.len()));
        }
        let (payload, check) = data.split_at(PAYLOAD_LEN);
        if checksum(payload) != check {
            return Err(AddressError::InvalidChecksum);
        }
        let (network, is_script) = Network::classify(payload[0])?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&payload[1..]);
        let destination = if is_script {
            Destination::ScriptHash(Hash256(hash))
        } else {
            Destination::KeyHash(Hash256(hash))
        };
        Ok(Self { network, destination })
    }

    /// Decode and require a specific network.
    pub fn decode_for(s: &str, network: Network) -> Result<Self, AddressError> {
        let addr = Self::decode(s)?;
        if addr.network != network {
            return Err(AddressError::WrongNetwork);
        }
        Ok(addr)
    }
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&second[..CHECKSUM_LEN]);
    out
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_addr(net: Network) -> Address {
        Address::new(Destination::KeyHash(Hash256([0x42; 32])), net)
    }

    #[test]
    fn encode_decode_key_address() {
        let addr = key_addr(Network::Mainnet);
        let s = addr.encode();
        assert_eq!(Address::decode(&s).unwrap(), addr);
        assert_eq!(s.parse::<Address>().unwrap(), addr);
    }

    #[test]
    fn script_and_key_addresses_differ() {
        let hash = Hash256([0x42; 32]);
        let key = Address::new(Destination::KeyHash(hash), Network::Testnet);
        let script = Address::new(Destination::ScriptHash(hash), Network::Testnet);
        assert_ne!(key.encode(), script.encode());
        assert_eq!(
            Address::decode(&script.encode()).unwrap().destination(),
            Destination::ScriptHash(hash)
        );
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let s = key_addr(Network::Mainnet).encode();
        let mut bytes = bs58::decode(&s).into_vec().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 1;
        let tampered = bs58::encode(bytes).into_string();
        assert_eq!(Address::decode(&tampered), Err(AddressError::InvalidChecksum));
    }

    #[test]
    fn wrong_length_rejected() {
        let s = bs58::encode([62u8; 10]).into_string();
        assert_eq!(Address::decode(&s), Err(AddressError::InvalidLength(10)));
    }

    #[test]
    fn invalid_characters_rejected() {
        assert_eq!(Address::decode("0OIl"), Err(AddressError::InvalidBase58));
    }

    #[test]
    fn network_is_enforced() {
        let s = key_addr(Network::Testnet).encode();
        assert_eq!(Address::decode_for(&s, Network::Mainnet), Err(AddressError::WrongNetwork));
        assert!(Address::decode_for(&s, Network::Testnet).is_ok());
    }

    #[test]
    fn data_script_has_no_address() {
        assert_eq!(
            Address::from_script(&Script::NullData(vec![1]), Network::Mainnet),
            Err(AddressError::NoDestination)
        );
    }

    #[test]
    fn serde_uses_text_form() {
        let addr = key_addr(Network::Mainnet);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"{}\"", addr.encode()));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
