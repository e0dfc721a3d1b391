//! Identity and time types for storage facades

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigError;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Opaque identity distinguishing one storage facade from another sharing
/// the same table. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FacadeIdentity(String);

impl FacadeIdentity {
    /// Create an identity, rejecting the empty string.
    pub fn new(identity: impl Into<String>) -> Result<Self, ConfigError> {
        let identity = identity.into();
        if identity.is_empty() {
            return Err(ConfigError::MissingIdentity);
        }
        Ok(Self(identity))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FacadeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for FacadeIdentity {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for FacadeIdentity {
    type Error = ConfigError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FacadeIdentity> for String {
    fn from(identity: FacadeIdentity) -> Self {
        identity.0
    }
}
