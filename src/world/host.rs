//! World host interface

use crate::population::ZoneInfo;
use crate::spawn::pool::SessionHandle;
use crate::spawn::request::{BotId, Position, ZoneId};

/// Reasons the host refused to bind a session
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BindError {
    #[error("Zone {0} is not loaded")]
    ZoneUnavailable(ZoneId),
    #[error("Bot {0} is already in the world")]
    AlreadyBound(BotId),
    #[error("Bind rejected: {0}")]
    Rejected(String),
}

/// The live game world. Implementations are called from the tick thread and
/// must not block.
pub trait WorldHost: Send + Sync {
    /// Bind a constructed session into the world
    fn spawn_into(
        &self,
        session: &SessionHandle,
        zone_id: ZoneId,
        position: Option<Position>,
    ) -> Result<(), BindError>;

    fn despawn(&self, bot_id: BotId, reason: &str);

    fn human_players_in_zone(&self, zone_id: ZoneId) -> u32;

    /// Bots currently in the world, used when the control plane restarts
    fn active_bots(&self) -> Vec<BotId>;

    /// Zones that currently hold human players
    fn zones_with_players(&self) -> Vec<ZoneInfo>;

    /// Database connections in use and available
    fn db_pool_usage(&self) -> (u32, u32) {
        (0, 0)
    }

    fn active_map_instances(&self) -> u32 {
        0
    }
}
