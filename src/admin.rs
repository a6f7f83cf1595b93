//! Admin contract consumed by the driver.
//!
//! The driver never talks to a storage server directly; everything goes through
//! an [`AdminClient`], which lists regions, reads per-family fragment counts and
//! asks the hosting server to major-compact one (region, family) pair. The
//! trait returns boxed futures so callers can hold it as `Arc<dyn AdminClient>`.

use std::{fmt, future::Future, pin::Pin};

use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Encoded name of a region, unique within the cluster.
    RegionId
);

string_id!(
    /// Host identity of a storage server (e.g. `host:port`).
    ServerName
);

/// A region and the server currently hosting it.
///
/// `server` is `None` while the region is unassigned or in transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLocation {
    /// Region identifier.
    pub region: RegionId,
    /// Hosting server, if assigned.
    pub server: Option<ServerName>,
}

impl RegionLocation {
    /// Location of a region hosted by `server`.
    pub fn assigned(region: impl Into<RegionId>, server: impl Into<ServerName>) -> Self {
        Self {
            region: region.into(),
            server: Some(server.into()),
        }
    }
}

/// Errors reported by the admin collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdminError {
    /// The table does not exist.
    #[error("table {0} not found")]
    TableNotFound(String),
    /// The region is unknown to the cluster.
    #[error("region {0} not found")]
    RegionNotFound(RegionId),
    /// The region has no store for the family.
    #[error("column family {family} not found in region {region}")]
    FamilyNotFound {
        /// Region that was addressed.
        region: RegionId,
        /// Missing family.
        family: String,
    },
    /// The region is being reassigned and has no host right now.
    #[error("region {0} is in transition")]
    RegionInTransition(RegionId),
    /// The region is now hosted elsewhere.
    #[error("region {region} moved to {server}")]
    RegionMoved {
        /// Region that moved.
        region: RegionId,
        /// Its new host.
        server: ServerName,
    },
    /// The hosting server did not answer.
    #[error("server {0} unavailable")]
    ServerUnavailable(ServerName),
    /// Any other transport-level failure.
    #[error("admin transport error: {0}")]
    Transport(String),
}

impl AdminError {
    /// Whether repeating the call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdminError::RegionInTransition(_)
                | AdminError::RegionMoved { .. }
                | AdminError::ServerUnavailable(_)
                | AdminError::Transport(_)
        )
    }
}

/// Boxed future returned by [`AdminClient`] methods.
pub type AdminFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AdminError>> + Send + 'a>>;

/// Cluster administration surface the driver depends on.
pub trait AdminClient: Send + Sync {
    /// List every region of `table` with its current host.
    fn list_regions<'a>(&'a self, table: &'a str) -> AdminFuture<'a, Vec<RegionLocation>>;

    /// Number of fragments (store files) the region holds for `family`.
    fn fragment_count<'a>(&'a self, region: &'a RegionId, family: &'a str)
        -> AdminFuture<'a, usize>;

    /// Ask the hosting server to major-compact the region's family.
    ///
    /// Resolves once the request is acknowledged; the merge itself happens
    /// asynchronously on the server.
    fn major_compact<'a>(&'a self, region: &'a RegionId, family: &'a str) -> AdminFuture<'a, ()>;

    /// Current host of a single region.
    fn region_location<'a>(&'a self, region: &'a RegionId)
        -> AdminFuture<'a, Option<ServerName>>;

    /// Milliseconds since the Unix epoch of the last completed major compaction
    /// of the pair, if the server tracks it.
    fn last_major_compaction<'a>(
        &'a self,
        _region: &'a RegionId,
        _family: &'a str,
    ) -> AdminFuture<'a, Option<u64>> {
        Box::pin(async { Ok(None) })
    }
}
