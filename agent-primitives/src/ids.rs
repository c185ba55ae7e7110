//! Identifier newtypes used across the runtime.
//!
//! Every identifier is a 128-bit UUID. `derived` constructors produce a
//! stable v5 UUID from a seed string so the same name always maps to the
//! same identifier.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a random identifier.
            #[must_use]
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Derives a stable identifier from a seed string.
            #[must_use]
            pub fn derived(seed: &str) -> Self {
                Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()))
            }

            /// Creates an identifier from an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::random()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::parse_str(s).map_err(Error::from)?;
                Ok(Self::from_uuid(uuid))
            }
        }
    };
}

uuid_id! {
    /// Unique identifier for an agent.
    AgentId
}

uuid_id! {
    /// Unique identifier for an entity (agent, user, or bot).
    EntityId
}

uuid_id! {
    /// Unique identifier for a room.
    RoomId
}

uuid_id! {
    /// Unique identifier for a world.
    WorldId
}

uuid_id! {
    /// Unique identifier for a memory record.
    MemoryId
}

uuid_id! {
    /// Identifier grouping related model calls and action steps.
    RunId
}
