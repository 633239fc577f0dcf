use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// How job and result payloads are wrapped on the broker.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Base64,
    Plain,
}

impl TransportMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "base64" => Some(TransportMode::Base64),
            "plain" | "none" => Some(TransportMode::Plain),
            _ => None,
        }
    }

    pub fn decode(&self, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self {
            TransportMode::Plain => Ok(payload.to_vec()),
            TransportMode::Base64 => {
                let compact: Vec<u8> = payload
                    .iter()
                    .copied()
                    .filter(|b| !b.is_ascii_whitespace() && *b != 0)
                    .collect();
                Ok(general_purpose::STANDARD.decode(compact)?)
            }
        }
    }

    pub fn encode(&self, plaintext: &[u8]) -> Vec<u8> {
        match self {
            TransportMode::Plain => plaintext.to_vec(),
            TransportMode::Base64 => general_purpose::STANDARD.encode(plaintext).into_bytes(),
        }
    }
}
