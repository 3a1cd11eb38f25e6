use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::error::{InvalidIdSnafu, ProtocolError, ProtocolResult};

// Backend rows are keyed by integer primary keys; wrappers keep session and
// message ids from being mixed up at call sites.
macro_rules! define_backend_id {
    ($name:ident, $id_type:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub fn parse(raw: &str) -> ProtocolResult<Self> {
                let parsed = raw.trim().parse::<u64>().context(InvalidIdSnafu {
                    stage: "parse-backend-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }

            pub const fn get(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl FromStr for $name {
            type Err = ProtocolError;

            fn from_str(raw: &str) -> ProtocolResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_backend_id!(SessionId, "session-id");
define_backend_id!(MessageId, "message-id");
