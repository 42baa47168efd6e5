use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid ledger kind: {0}")]
    InvalidLedgerKind(String),
    #[error("invalid battle payload: {0}")]
    InvalidBattlePayload(String),
}
