//! Device identity value object.
//! Identities are immutable and keyed by address only.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::platform::Advertisement;

static MAC_RE: OnceLock<Regex> = OnceLock::new();

fn mac_regex() -> &'static Regex {
    MAC_RE.get_or_init(|| {
        Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").expect("mac address pattern compiles")
    })
}

/// Immutable description of a remote peripheral.
///
/// Two identities are equal iff their addresses match case-insensitively;
/// the advertised name, RSSI and advertisement payload are informational
/// and take no part in equality or hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    address: String,
    name: Option<String>,
    rssi: Option<i16>,
    advertisement: Option<Vec<u8>>,
    service_uuids: Option<Vec<Uuid>>,
}

impl DeviceIdentity {
    /// Creates a fully populated identity, normalizing the address.
    pub fn new(
        address: &str,
        name: Option<String>,
        rssi: Option<i16>,
        advertisement: Option<Vec<u8>>,
        service_uuids: Option<Vec<Uuid>>,
    ) -> Self {
        Self {
            address: address.to_uppercase(),
            name,
            rssi,
            advertisement,
            service_uuids,
        }
    }

    /// Wraps a bare address string into a minimal identity.
    ///
    /// Platform device ids often embed the MAC inside a longer token, so the
    /// last MAC-shaped group found in `raw` is used. Fails when no address
    /// can be extracted.
    pub fn from_address(raw: &str) -> Result<Self, EngineError> {
        let address = mac_regex()
            .find_iter(raw)
            .last()
            .map(|m| m.as_str().to_uppercase())
            .ok_or_else(|| EngineError::NoTargetDevice(raw.to_string()))?;
        Ok(Self {
            address,
            name: None,
            rssi: None,
            advertisement: None,
            service_uuids: None,
        })
    }

    pub(crate) fn from_advertisement(adv: &Advertisement) -> Self {
        Self {
            address: adv.address.to_uppercase(),
            name: adv.name.clone(),
            rssi: adv.rssi,
            advertisement: adv.payload.clone(),
            service_uuids: if adv.service_uuids.is_empty() {
                None
            } else {
                Some(adv.service_uuids.clone())
            },
        }
    }

    /// Normalized (uppercase) peripheral address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Advertised device name, if one was seen.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Signal strength at discovery time.
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Raw advertisement payload, if captured.
    pub fn advertisement(&self) -> Option<&[u8]> {
        self.advertisement.as_deref()
    }

    /// Service UUIDs carried in the advertisement.
    pub fn service_uuids(&self) -> Option<&[Uuid]> {
        self.service_uuids.as_deref()
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.address.eq_ignore_ascii_case(&other.address)
    }
}

impl Eq for DeviceIdentity {}

impl Hash for DeviceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.to_uppercase().hash(state);
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}
