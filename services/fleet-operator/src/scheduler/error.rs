//! Errors raised while reconciling one region.

use std::fmt;

use psfleet_id::RegionId;
use psfleet_reconcile::Track;
use thiserror::Error;

use crate::db::DbError;
use crate::provider::ProviderError;

/// Where in the tick an error happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub component: &'static str,
    pub region_id: RegionId,
    pub track: Option<Track>,
}

impl Scope {
    pub fn new(component: &'static str, region_id: RegionId, track: Option<Track>) -> Self {
        Self {
            component,
            region_id,
            track,
        }
    }

    pub fn ledger(&self, source: DbError) -> ReconcileError {
        ReconcileError::Ledger {
            scope: self.clone(),
            source,
        }
    }

    pub fn provider(&self, source: ProviderError) -> ReconcileError {
        ReconcileError::Provider {
            scope: self.clone(),
            source,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.track {
            Some(track) => write!(f, "{} [{} {}]", self.component, self.region_id, track),
            None => write!(f, "{} [{}]", self.component, self.region_id),
        }
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{scope}: ledger: {source}")]
    Ledger {
        scope: Scope,
        #[source]
        source: DbError,
    },

    #[error("{scope}: provider: {source}")]
    Provider {
        scope: Scope,
        #[source]
        source: ProviderError,
    },
}

impl ReconcileError {
    pub fn scope(&self) -> &Scope {
        match self {
            ReconcileError::Ledger { scope, .. } | ReconcileError::Provider { scope, .. } => scope,
        }
    }

    /// Lost ledger connectivity ends the tick and the process. Everything
    /// else only skips the current region.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReconcileError::Ledger { source, .. } if source.is_connectivity())
    }
}
