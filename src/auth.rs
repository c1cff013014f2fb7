//! Device authentication
//!
//! Devices present an opaque token in their `hello`. Token issuance is out of
//! scope; verification happens behind [`AuthProvider`] so deployments can
//! swap in their own scheme.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::protocol::DeviceId;
use crate::{Error, Result};

/// Verifies device credentials and yields the authenticated identity
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Verify a device token
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] when the credentials are rejected; no session
    /// is created in that case.
    async fn verify_device(&self, device: &DeviceId, token: &str) -> Result<DeviceId>;
}

/// Shared-secret verifier: the expected token is the hex SHA-256 of
/// `"{secret}:{device_id}"`, matching what provisioning bakes into firmware
pub struct SharedSecretAuth {
    secret: String,
}

impl SharedSecretAuth {
    /// Create a verifier over the deployment secret
    #[must_use]
    pub const fn new(secret: String) -> Self {
        Self { secret }
    }

    /// The token provisioning should install for a device
    #[must_use]
    pub fn expected_token(&self, device: &DeviceId) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(device.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl AuthProvider for SharedSecretAuth {
    async fn verify_device(&self, device: &DeviceId, token: &str) -> Result<DeviceId> {
        let expected = self.expected_token(device);
        // Both sides are fixed-length hex; compare without early exit
        let matches = expected.len() == token.len()
            && expected
                .bytes()
                .zip(token.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0;
        if matches {
            Ok(device.clone())
        } else {
            Err(Error::Auth(format!("token rejected for device {device}")))
        }
    }
}

/// Accept-all verifier for development setups without provisioning
pub struct OpenAuth;

#[async_trait]
impl AuthProvider for OpenAuth {
    async fn verify_device(&self, device: &DeviceId, _token: &str) -> Result<DeviceId> {
        Ok(device.clone())
    }
}
