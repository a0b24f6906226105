//! Kademlia node Id or a lookup target
use rand::Rng;
use sha2::{Digest, Sha256};
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

/// The size of node IDs in bytes.
pub const ID_SIZE: usize = 32;
/// The size of node IDs in bits, also the distance to the furthest possible Id.
pub const MAX_DISTANCE: u16 = ID_SIZE as u16 * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target.
///
/// Node ids are the SHA-256 digest of the node's raw ed25519 public key,
/// manifest hashes share the same 256-bit space.
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// Generate a random Id, useful as a lookup target or in tests.
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id, InvalidIdSize> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// Derive the node Id of a raw public key.
    ///
    /// Every implementation of the mesh must agree on this byte for byte.
    pub fn from_public_key(public_key: &[u8]) -> Id {
        Id(Sha256::digest(public_key).into())
    }

    /// XOR metric between this Id and another, as an Id so it can be
    /// compared as an unsigned big endian integer.
    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            result[i] = a ^ b;
        }

        Id(result)
    }

    /// Simplified XOR distance between this Id and a target Id.
    ///
    /// The distance is the bit length of the XOR result.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Id is 256
    /// Distance to an Id with 5 leading matching bits is 251
    pub fn distance(&self, other: &Id) -> u16 {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                // leading zeros so far + leading zeros of this byte
                let leading_zeros = i as u16 * 8 + (a ^ b).leading_zeros() as u16;

                return MAX_DISTANCE - leading_zeros;
            }
        }

        0
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

impl From<Id> for [u8; ID_SIZE] {
    fn from(id: Id) -> [u8; ID_SIZE] {
        id.0
    }
}

impl TryFrom<&[u8]> for Id {
    type Error = InvalidIdSize;

    fn try_from(bytes: &[u8]) -> Result<Id, InvalidIdSize> {
        Id::from_bytes(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = DecodeIdError;

    fn from_str(s: &str) -> Result<Id, DecodeIdError> {
        if s.len() != ID_SIZE * 2 {
            return Err(DecodeIdError::InvalidIdSize(InvalidIdSize(s.len() / 2)));
        }

        let mut bytes = [0_u8; ID_SIZE];

        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).map_err(|_| DecodeIdError::InvalidHex)?;
            bytes[i] = u8::from_str_radix(pair, 16).map_err(|_| DecodeIdError::InvalidHex)?;
        }

        Ok(Id(bytes))
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid Id size, expected {ID_SIZE} bytes, got {0}")]
pub struct InvalidIdSize(pub usize);

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Errors parsing an [Id] from a hex string.
pub enum DecodeIdError {
    #[error(transparent)]
    InvalidIdSize(#[from] InvalidIdSize),

    #[error("Invalid hex character in Id")]
    InvalidHex,
}
