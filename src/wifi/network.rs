//! Scanned network data structures.
//!
//! Drivers report [`RawNetwork`] entries in their own units; the scanner turns
//! them into [`Network`] entries with a normalized 0-100 quality.
//!
//! # Example
//!
//! ```
//! use ble_wifi_provisioner::wifi::{normalize_quality, Encryption};
//!
//! assert_eq!(normalize_quality(70, 70), 100);
//! assert_eq!(normalize_quality(35, 70), 50);
//! assert_eq!(Encryption::from_flags(false, true, true), Encryption::WpaWpa2);
//! ```

use serde::Serialize;
use std::fmt;
use std::time::Instant;

/// Quality reference used by drivers that report `Quality=NN/70` (iwlist style).
pub const DEFAULT_QUALITY_REFERENCE: i32 = 70;

/// Display name used for networks that hide their SSID.
pub const HIDDEN_SSID_LABEL: &str = "<HIDDEN>";

/// Encryption advertised by an access point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Encryption {
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "WEP")]
    Wep,
    #[serde(rename = "WPA")]
    Wpa,
    #[serde(rename = "WPA2")]
    Wpa2,
    #[serde(rename = "WPA_WPA2")]
    WpaWpa2,
}

impl Encryption {
    /// Derive the encryption type from driver capability flags.
    ///
    /// WEP wins over everything else; an AP offering both WPA generations is
    /// reported as mixed mode.
    pub fn from_flags(wep: bool, wpa: bool, wpa2: bool) -> Self {
        match (wep, wpa, wpa2) {
            (true, _, _) => Self::Wep,
            (false, true, true) => Self::WpaWpa2,
            (false, true, false) => Self::Wpa,
            (false, false, true) => Self::Wpa2,
            (false, false, false) => Self::None,
        }
    }

    /// Wire name, as used in GATT payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Wep => "WEP",
            Self::Wpa => "WPA",
            Self::Wpa2 => "WPA2",
            Self::WpaWpa2 => "WPA_WPA2",
        }
    }
}

impl fmt::Display for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A network as reported by the driver, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNetwork {
    /// SSID, empty for hidden networks.
    pub ssid: String,
    /// Access point hardware address.
    pub bssid: String,
    /// Link quality in driver units (see [`super::WifiInterface::quality_reference`]).
    pub quality: i32,
    /// Signal strength in dBm, if the driver reports it.
    pub strength_dbm: Option<i32>,
    /// Advertised encryption.
    pub encryption: Encryption,
}

/// A network in a published scan snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    /// SSID, empty for hidden networks.
    pub ssid: String,
    /// Unique key.
    pub bssid: String,
    /// Normalized quality, 0-100.
    pub signal_quality: u8,
    /// Signal strength in dBm, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength_dbm: Option<i32>,
    pub encryption: Encryption,
    #[serde(skip)]
    pub last_seen_at: Instant,
}

impl Network {
    /// Build a network from a raw driver entry.
    pub fn from_raw(raw: &RawNetwork, quality_reference: i32, seen_at: Instant) -> Self {
        Self {
            ssid: raw.ssid.clone(),
            bssid: raw.bssid.clone(),
            signal_quality: normalize_quality(raw.quality, quality_reference),
            strength_dbm: raw.strength_dbm,
            encryption: raw.encryption,
            last_seen_at: seen_at,
        }
    }

    /// SSID for display, with hidden networks labelled.
    pub fn display_ssid(&self) -> &str {
        if self.ssid.is_empty() {
            HIDDEN_SSID_LABEL
        } else {
            &self.ssid
        }
    }
}

/// Normalize a raw driver quality to 0-100.
///
/// Computes `floor(raw / reference * 100)` clamped to `[0, 100]`. A
/// non-positive reference yields 0.
pub fn normalize_quality(raw: i32, reference: i32) -> u8 {
    if reference <= 0 {
        return 0;
    }
    let scaled = (raw as i64 * 100).div_euclid(reference as i64);
    scaled.clamp(0, 100) as u8
}
