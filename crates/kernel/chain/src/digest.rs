use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Digest as _;

use crate::error::ChainError;

/// Hash algorithms the chain can be written with.
///
/// Readers accept every variant listed here. The algorithm travels inside the
/// rendered digest (`"blake3:..."`, `"sha256:..."`) so an old chain stays
/// verifiable after the writer switches algorithm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    Blake3,
    Sha256,
}

impl HashAlgorithm {
    pub fn tag(self) -> &'static str {
        match self {
            HashAlgorithm::Blake3 => "blake3",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self, ChainError> {
        match tag {
            "blake3" => Ok(HashAlgorithm::Blake3),
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(ChainError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    pub fn digest(self, data: &[u8]) -> Digest {
        let bytes = match self {
            HashAlgorithm::Blake3 => *blake3::hash(data).as_bytes(),
            HashAlgorithm::Sha256 => {
                let result = sha2::Sha256::digest(data);
                let mut out = [0u8; 32];
                out.copy_from_slice(&result);
                out
            }
        };
        Digest {
            algorithm: self,
            bytes,
        }
    }
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Blake3
    }
}

/// A 32-byte digest tagged with the algorithm that produced it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest {
    pub algorithm: HashAlgorithm,
    pub bytes: [u8; 32],
}

impl Digest {
    /// `prev_hash` of the genesis envelope.
    pub const GENESIS_SENTINEL: Digest = Digest {
        algorithm: HashAlgorithm::Blake3,
        bytes: [0u8; 32],
    };

    pub fn new(algorithm: HashAlgorithm, bytes: [u8; 32]) -> Self {
        Self { algorithm, bytes }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm.tag(), self.to_hex())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::str::FromStr for Digest {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, hex_part) = s
            .split_once(':')
            .ok_or_else(|| ChainError::MalformedDigest(s.to_string()))?;
        let algorithm = HashAlgorithm::from_tag(tag)?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_part, &mut bytes)
            .map_err(|_| ChainError::MalformedDigest(s.to_string()))?;
        Ok(Self { algorithm, bytes })
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
