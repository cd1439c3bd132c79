//! Strong newtypes for domain identifiers.
//!
//! These newtypes prevent accidental misuse of IDs (e.g. passing a
//! `BatchId` where a `RepositoryId` is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            #[inline]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            #[inline]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(
    /// Repository identifier (database primary key).
    RepositoryId
);

id_newtype!(
    /// Batch identifier (database primary key).
    BatchId
);

id_newtype!(
    /// Source identifier (database primary key).
    SourceId
);

id_newtype!(
    /// Migration history row identifier.
    HistoryId
);

id_newtype!(
    /// Discovery run identifier.
    DiscoveryId
);
