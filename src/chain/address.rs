use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde::{Deserialize, Serialize};

const FRIENDLY_LEN: usize = 48;
const FLAG_BOUNCEABLE: u8 = 0x11;
const FLAG_NON_BOUNCEABLE: u8 = 0x51;
const FLAG_TESTNET: u8 = 0x80;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid workchain in {0}")]
    Workchain(String),

    #[error("invalid account hash in {0}")]
    Hash(String),

    #[error("invalid user-friendly address {0}")]
    Encoding(String),

    #[error("checksum mismatch for {0}")]
    Checksum(String),
}

/// Standard account address: a workchain id plus the 256-bit account hash.
///
/// Accepts both the raw `wc:hex` form and the 48-character user-friendly
/// base64 form. Equality, hashing and the `Display` output always use the raw
/// form, so addresses coming from different sources compare correctly.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    workchain: i32,
    hash: [u8; 32],
}

impl Address {
    pub fn new(workchain: i32, hash: [u8; 32]) -> Self {
        Self { workchain, hash }
    }

    pub fn workchain(&self) -> i32 {
        self.workchain
    }

    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    /// Encodes the address in url-safe user-friendly form
    pub fn to_friendly(&self, bounceable: bool, testnet: bool) -> String {
        let mut bytes = [0u8; 36];
        bytes[0] = if bounceable {
            FLAG_BOUNCEABLE
        } else {
            FLAG_NON_BOUNCEABLE
        };
        if testnet {
            bytes[0] |= FLAG_TESTNET;
        }
        bytes[1] = self.workchain as i8 as u8;
        bytes[2..34].copy_from_slice(&self.hash);
        let crc = crc16(&bytes[..34]);
        bytes[34..].copy_from_slice(&crc.to_be_bytes());

        URL_SAFE.encode(bytes)
    }

    fn parse_raw(s: &str, workchain: &str, hash: &str) -> Result<Self, AddressError> {
        let workchain = workchain
            .parse::<i32>()
            .map_err(|_| AddressError::Workchain(s.to_owned()))?;

        let mut out = [0u8; 32];
        hex::decode_to_slice(hash, &mut out).map_err(|_| AddressError::Hash(s.to_owned()))?;

        Ok(Self::new(workchain, out))
    }

    fn parse_friendly(s: &str) -> Result<Self, AddressError> {
        if s.len() != FRIENDLY_LEN {
            return Err(AddressError::Encoding(s.to_owned()));
        }

        let bytes = if s.contains(['-', '_']) {
            URL_SAFE.decode(s)
        } else {
            STANDARD.decode(s)
        }
        .map_err(|_| AddressError::Encoding(s.to_owned()))?;

        if bytes.len() != 36 {
            return Err(AddressError::Encoding(s.to_owned()));
        }

        let expected = u16::from_be_bytes([bytes[34], bytes[35]]);
        if crc16(&bytes[..34]) != expected {
            return Err(AddressError::Checksum(s.to_owned()));
        }

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[2..34]);

        Ok(Self::new(bytes[1] as i8 as i32, hash))
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once(':') {
            Some((workchain, hash)) => Self::parse_raw(s, workchain, hash),
            None => Self::parse_friendly(s),
        }
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.workchain, hex::encode(self.hash))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// CRC16/XMODEM, as used by the user-friendly address checksum
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}
