use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifier of a chain taking part in relaying.
///
/// Every known chain carries a unique numeric tag. Tags this build does not
/// know about decode to [`ChainId::Unrecognized`] instead of failing, so
/// messages from newer peers can still be stored and forwarded.
///
/// Equality, ordering and hashing go by [`ChainId::tag`], so
/// `Unrecognized(1)` is the same chain as `Ethereum`.
#[derive(Debug, Clone, Copy)]
pub enum ChainId {
    Ethereum,
    Polkadot,
    Solana,
    Sui,
    Arbitrum,
    Optimism,
    Polygon,
    Unrecognized(u32),
}

const KNOWN_CHAINS: [(ChainId, u32, &str); 7] = [
    (ChainId::Ethereum, 1, "ethereum"),
    (ChainId::Polkadot, 2, "polkadot"),
    (ChainId::Solana, 3, "solana"),
    (ChainId::Sui, 4, "sui"),
    (ChainId::Arbitrum, 5, "arbitrum"),
    (ChainId::Optimism, 6, "optimism"),
    (ChainId::Polygon, 7, "polygon"),
];

impl ChainId {
    pub fn tag(&self) -> u32 {
        match self {
            ChainId::Ethereum => 1,
            ChainId::Polkadot => 2,
            ChainId::Solana => 3,
            ChainId::Sui => 4,
            ChainId::Arbitrum => 5,
            ChainId::Optimism => 6,
            ChainId::Polygon => 7,
            ChainId::Unrecognized(tag) => *tag,
        }
    }

    pub fn from_tag(tag: u32) -> Self {
        KNOWN_CHAINS
            .iter()
            .find(|(_, known, _)| *known == tag)
            .map(|(chain, _, _)| *chain)
            .unwrap_or(ChainId::Unrecognized(tag))
    }

    /// Lowercase name, `None` for unrecognized tags.
    pub fn name(&self) -> Option<&'static str> {
        let tag = self.tag();
        KNOWN_CHAINS
            .iter()
            .find(|(_, known, _)| *known == tag)
            .map(|(_, _, name)| *name)
    }

    pub fn is_recognized(&self) -> bool {
        self.name().is_some()
    }
}

impl PartialEq for ChainId {
    fn eq(&self, other: &Self) -> bool {
        self.tag() == other.tag()
    }
}

impl Eq for ChainId {}

impl Hash for ChainId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag().hash(state);
    }
}

impl PartialOrd for ChainId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChainId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tag().cmp(&other.tag())
    }
}

impl From<u32> for ChainId {
    fn from(tag: u32) -> Self {
        ChainId::from_tag(tag)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "unrecognized({})", self.tag()),
        }
    }
}

impl FromStr for ChainId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        if let Some((chain, _, _)) = KNOWN_CHAINS.iter().find(|(_, _, name)| *name == lowered) {
            return Ok(*chain);
        }
        lowered
            .parse::<u32>()
            .map(ChainId::from_tag)
            .map_err(|_| format!("unknown chain: {}", s))
    }
}

impl Serialize for ChainId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.tag().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ChainId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(ChainId::from_tag)
    }
}
