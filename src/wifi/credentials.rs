//! Join requests and DHCP lease data.
//!
//! # Example
//!
//! ```
//! use ble_wifi_provisioner::wifi::JoinRequest;
//!
//! let request = JoinRequest::new("MyNetwork", "MyPassword").unwrap();
//! assert!(!request.is_open());
//!
//! let open = JoinRequest::new("Stable", "").unwrap();
//! assert!(open.is_open());
//! ```

use std::fmt;
use std::net::IpAddr;
use std::time::Instant;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum SSID length per IEEE 802.11 standard.
pub const MAX_SSID_LEN: usize = 32;

/// Maximum password length for WPA2.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Minimum password length for WPA2.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Network secret. Zeroed when dropped, never printed.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Expose the secret to a driver call.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(****, {} bytes)", self.0.len())
    }
}

/// A request to join a network, created from a GATT write.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    /// Network SSID (1-32 bytes).
    pub ssid: String,
    /// Network password (8-64 bytes, empty for open networks).
    pub credential: Credential,
    /// When the request was received.
    pub requested_at: Instant,
}

impl JoinRequest {
    /// Create a validated join request.
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Result<Self, CredentialError> {
        let request = Self {
            ssid: ssid.into(),
            credential: Credential::new(password),
            requested_at: Instant::now(),
        };
        request.validate()?;
        Ok(request)
    }

    /// Validate SSID and password lengths.
    pub fn validate(&self) -> Result<(), CredentialError> {
        if self.ssid.is_empty() {
            return Err(CredentialError::SsidEmpty);
        }
        if self.ssid.len() > MAX_SSID_LEN {
            return Err(CredentialError::SsidTooLong {
                len: self.ssid.len(),
                max: MAX_SSID_LEN,
            });
        }

        // Empty is OK for open networks
        let password_len = self.credential.len();
        if password_len > 0 && password_len < MIN_PASSWORD_LEN {
            return Err(CredentialError::PasswordTooShort {
                len: password_len,
                min: MIN_PASSWORD_LEN,
            });
        }
        if password_len > MAX_PASSWORD_LEN {
            return Err(CredentialError::PasswordTooLong {
                len: password_len,
                max: MAX_PASSWORD_LEN,
            });
        }

        Ok(())
    }

    /// Check if this targets an open network (no password).
    pub fn is_open(&self) -> bool {
        self.credential.is_empty()
    }
}

/// DHCP lease obtained after association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    pub ip_address: IpAddr,
    pub acquired_at: Instant,
    pub expires_at: Option<Instant>,
}

impl LeaseInfo {
    /// Lease acquired now, with no known expiry.
    pub fn new(ip_address: IpAddr) -> Self {
        Self {
            ip_address,
            acquired_at: Instant::now(),
            expires_at: None,
        }
    }
}

/// Credential validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("SSID cannot be empty")]
    SsidEmpty,
    #[error("SSID too long: {len} bytes (max {max})")]
    SsidTooLong { len: usize, max: usize },
    #[error("password too short: {len} bytes (min {min})")]
    PasswordTooShort { len: usize, min: usize },
    #[error("password too long: {len} bytes (max {max})")]
    PasswordTooLong { len: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_request() {
        let request = JoinRequest::new("TestNetwork", "password123").unwrap();
        assert_eq!(request.ssid, "TestNetwork");
        assert_eq!(request.credential.expose(), "password123");
        assert!(!request.is_open());
    }

    #[test]
    fn test_open_network() {
        let request = JoinRequest::new("Stable", "").unwrap();
        assert!(request.is_open());
    }

    #[test]
    fn test_empty_ssid() {
        let result = JoinRequest::new("", "password123");
        assert_eq!(result.unwrap_err(), CredentialError::SsidEmpty);
    }

    #[test]
    fn test_ssid_length_limits() {
        assert!(JoinRequest::new("a".repeat(32), "password123").is_ok());
        assert!(matches!(
            JoinRequest::new("a".repeat(33), "password123"),
            Err(CredentialError::SsidTooLong { len: 33, max: 32 })
        ));
    }

    #[test]
    fn test_password_length_limits() {
        assert!(matches!(
            JoinRequest::new("TestNetwork", "short"),
            Err(CredentialError::PasswordTooShort { .. })
        ));
        assert!(JoinRequest::new("TestNetwork", "12345678").is_ok());
        assert!(JoinRequest::new("TestNetwork", "a".repeat(64)).is_ok());
        assert!(matches!(
            JoinRequest::new("TestNetwork", "a".repeat(65)),
            Err(CredentialError::PasswordTooLong { .. })
        ));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let request = JoinRequest::new("TestNetwork", "hunter2hunter2").unwrap();
        let debug = format!("{:?}", request);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("****"));
    }

    #[test]
    fn test_credential_zeroize() {
        let mut credential = Credential::new("secret-secret");
        credential.zeroize();
        assert!(credential.is_empty());
    }
}
