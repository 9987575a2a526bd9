//! Cluster-wide identity keys. All cross-references between hosts, nodes and
//! queue endpoints travel as plain integer keys minted by the context; the
//! owning registries map keys back to state. Key zero is never allocated and
//! doubles as "none" in wire frames.

use serde_derive::{Deserialize, Serialize};
use std::fmt;

macro_rules! key_type {
    ($name: ident) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const NONE: $name = $name(0);

            #[inline]
            pub fn raw(self) -> u64 {
                self.0
            }

            #[inline]
            pub fn is_none(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(raw: u64) -> $name {
                $name(raw)
            }
        }
    };
}

key_type!(HostKey);
key_type!(NodeKey);
key_type!(EndpointKey);
