use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireMessage {
    #[serde(rename = "y")]
    pub message_type: String,

    #[serde(rename = "id", with = "serde_bytes")]
    pub sender_id: [u8; 32],

    #[serde(rename = "k", with = "serde_bytes")]
    pub public_key: [u8; 32],

    #[serde(rename = "p", with = "serde_bytes")]
    pub payload: Vec<u8>,

    #[serde(rename = "ts")]
    pub timestamp: u64,

    #[serde(rename = "r", with = "serde_bytes")]
    pub request_id: [u8; 16],

    #[serde(rename = "s", with = "serde_bytes")]
    pub signature: [u8; 64],

    #[serde(rename = "port")]
    pub sender_port: u16,
}

impl WireMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<WireMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireNode {
    #[serde(with = "serde_bytes")]
    pub id: [u8; 32],
    pub ip: String,
    pub port: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireTarget {
    #[serde(with = "serde_bytes")]
    pub target: [u8; 32],
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireNodes {
    pub nodes: Vec<WireNode>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireProviders {
    pub providers: Vec<WireNode>,
    pub nodes: Vec<WireNode>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireError {
    pub code: i64,
    pub description: String,
}
