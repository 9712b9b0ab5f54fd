//! # psfleet-id
//!
//! Typed identifiers for the streaming fleet ledger.
//!
//! Ledger rows (instances, regions, sessions) use a prefixed ULID format,
//! `{prefix}_{ulid}`:
//!
//! - `psi_01HV4Z4NYPLTRS0JTUA8XDME5F` (instance)
//! - `reg_01HV4Z2WQXKJNM8GPQY6VBKC3D` (region)
//! - `pss_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (session)
//!
//! ULIDs are time ordered, so a ledger id minted for a newer reservation
//! sorts after an older one. Provider-assigned identifiers are opaque and
//! carried by [`ProviderInstanceId`].

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
