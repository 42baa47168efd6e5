use serde::{Deserialize, Serialize};

use crate::ids::{HouseId, PlayerId};
use crate::money::Amount;

/// Member as pushed in the platform's member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub player: PlayerId,
    pub nickname: String,
    pub right: i32,
}

/// Member as known to the business backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub house: HouseId,
    pub player: PlayerId,
    /// Empty when the member belongs to no group.
    pub group_name: String,
    /// Added on top of the resolved credit threshold.
    pub credit_adjustment: Amount,
    pub forbidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HouseApplication {
    pub house: HouseId,
    pub applicant: PlayerId,
    pub nickname: String,
    pub apply_type: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginInfo {
    pub user_id: i64,
    pub nickname: String,
    pub houses: Vec<HouseId>,
}
