//! Identifier types for fleet ledger rows and provider instances.

use crate::{define_id, IdError};

// =============================================================================
// Ledger rows
// =============================================================================

define_id!(
    /// Ledger identity of a streaming instance row, assigned at reservation.
    InstanceId,
    "psi"
);
define_id!(
    /// Ledger identity of a deployment region.
    RegionId,
    "reg"
);
define_id!(
    /// Ledger identity of a user streaming session.
    SessionId,
    "pss"
);

// =============================================================================
// Provider identity
// =============================================================================

/// Identifier the compute provider assigns to a launched instance
/// (for example `i-0123456789abcdef0`).
///
/// Opaque to the operator: it is never generated locally, only copied from
/// provider responses into the ledger.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProviderInstanceId(String);

impl ProviderInstanceId {
    /// Validates and wraps a provider identifier.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(IdError::InvalidProviderId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderInstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ProviderInstanceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for ProviderInstanceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for ProviderInstanceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ProviderInstanceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
