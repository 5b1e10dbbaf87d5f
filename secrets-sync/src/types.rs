//! Values shared by the cache, the resolver and the reconciler

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Final key/value output for one mapping resource.
pub type ResolvedDocument = BTreeMap<String, Vec<u8>>;

/// Remote secret metadata, without its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDescriptor {
    /// Secret name as known to the remote service
    pub id: String,

    /// Tags attached to the secret
    pub tags: HashMap<String, String>,

    /// Version currently labelled as current
    pub version_id: String,
}

/// A fetched secret value.
///
/// JSON objects whose values are all strings become `Map`; anything else is
/// kept as opaque bytes. A map keeps the payload it was parsed from.
#[derive(Clone, PartialEq, Eq)]
pub enum SecretValue {
    Bytes(Vec<u8>),
    Map {
        raw: Vec<u8>,
        map: BTreeMap<String, String>,
    },
}

impl SecretValue {
    /// Classify a raw payload fetched from the remote service.
    pub fn parse(raw: Vec<u8>) -> Self {
        match serde_json::from_slice::<BTreeMap<String, String>>(&raw) {
            Ok(map) => SecretValue::Map { raw, map },
            Err(_) => SecretValue::Bytes(raw),
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            SecretValue::Map { map, .. } => Some(map),
            SecretValue::Bytes(_) => None,
        }
    }

    /// The payload exactly as fetched.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            SecretValue::Bytes(bytes) | SecretValue::Map { raw: bytes, .. } => bytes,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretValue::Bytes(bytes) => write!(f, "Bytes([REDACTED; {}])", bytes.len()),
            SecretValue::Map { map, .. } => f
                .debug_map()
                .entries(map.keys().map(|k| (k, "[REDACTED]")))
                .finish(),
        }
    }
}

/// A value held by the secret cache together with the version it was fetched at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    pub version_id: String,
    pub value: SecretValue,
}

/// Temporary credentials obtained by assuming a role.
#[derive(Debug, Clone)]
pub struct RoleCredentials {
    pub role: String,
    pub access_key_id: String,
    pub secret_access_key: SecretString,
    pub session_token: Option<SecretString>,
    pub expiration: Option<DateTime<Utc>>,
}

impl RoleCredentials {
    /// Whether the credentials are still usable for at least `margin`.
    pub fn is_fresh(&self, margin: chrono::Duration) -> bool {
        match self.expiration {
            Some(expiration) => Utc::now() + margin < expiration,
            None => true,
        }
    }
}
