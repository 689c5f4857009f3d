use crate::config::ConfigError;
use crate::orderbook::book::ApplyError;
use crate::orderbook::decoder::DecodeError;
use crate::orderbook::manager::ManagerError;
use crate::orderbook::publisher::PublishError;
use crate::orderbook::rate_limiter::LimiterError;
use crate::orderbook::sequence::SequenceGap;
use crate::orderbook::snapshot::SnapshotError;
use thiserror::Error;

/// Crate-level error roll-up for callers that cross module boundaries.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Sequence(#[from] SequenceGap),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Limiter(#[from] LimiterError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

pub type Result<T> = std::result::Result<T, Error>;
