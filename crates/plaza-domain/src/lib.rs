pub mod battle;
pub mod errors;
pub mod ids;
pub mod member;
pub mod money;
pub mod table;

pub use battle::{BattleRecord, BattleRoom, PlayerScore};
pub use errors::DomainError;
pub use ids::{ActorId, GameKindId, HouseId, MappedTableNum, PlayerId, SessionKey};
pub use member::{HouseApplication, LoginInfo, MemberInfo, MemberRecord};
pub use money::{Amount, MoneyError};
pub use table::{SeatEvent, StandEvent, TableInfo};
