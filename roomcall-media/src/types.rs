//! Identifier newtypes shared by every component of the session core

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id! {
    /// Identifier of a call room on the SFU
    RoomId
}

string_id! {
    /// Identifier of a remote participant (the server's socket id)
    PeerId
}

string_id! {
    /// Identifier of a server-side transport
    TransportId
}

string_id! {
    /// Identifier of a producer, local or remote
    ProducerId
}

string_id! {
    /// Identifier of a consumer created on the recv transport
    ConsumerId
}

string_id! {
    /// Identifier of a media track or stream
    TrackId
}

impl TrackId {
    /// Fresh random identifier for a locally created track or stream
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = ProducerId::from("p-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"p-1\"");
        let back: ProducerId = serde_json::from_str("\"p-1\"").unwrap();
        assert_eq!(back, id);
        assert_eq!(id.to_string(), "p-1");
    }

    #[test]
    fn test_generated_track_ids_are_unique() {
        assert_ne!(TrackId::generate(), TrackId::generate());
    }
}
