use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($name:ident, $inner:ty) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            #[must_use]
            pub fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }
    };
}

// Business-side account that owns a platform credential.
numeric_id!(ActorId, i64);
numeric_id!(HouseId, i64);
// Game-level player id as reported by the platform.
numeric_id!(PlayerId, i64);
numeric_id!(MappedTableNum, i32);
numeric_id!(GameKindId, i32);

impl GameKindId {
    pub const ANY: Self = Self(0);
}

/// One platform session is owned per (controlling account, house).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub actor: ActorId,
    pub house: HouseId,
}

impl SessionKey {
    #[must_use]
    pub fn new(actor: ActorId, house: HouseId) -> Self {
        Self { actor, house }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.actor, self.house)
    }
}
