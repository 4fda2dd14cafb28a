//! Storage shared by the fluid and energy networks: a [`Pool`] of some
//! resource, a per-face [`Holder`] exposing pools to a network, and the
//! [`PoolDistributor`] moving resources between holders of one channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::resource::Distributor;
use super::{ChannelId, ConnectionType};
use crate::world::position::BlockFace;

/// A thread-safe store of a single resource.
pub trait Pool: Send + Sync + 'static {
    /// What kind of resource is stored (e.g. a fluid type). `()` for
    /// resources without variants.
    type Content: Copy + PartialEq + Send + Sync + fmt::Debug;

    /// The stored content, `None` while empty.
    fn content(&self) -> Option<Self::Content>;

    fn amount(&self) -> u64;

    /// Room left for `content`; 0 if incompatible with what is stored.
    fn space_for(&self, content: Self::Content) -> u64;

    /// Remove up to `max`, returning the amount removed.
    fn extract(&self, max: u64) -> u64;

    /// Add up to `amount` of `content`, returning the amount accepted.
    fn insert(&self, content: Self::Content, amount: u64) -> u64;
}

pub struct HolderFace<P> {
    pub pool: Arc<P>,
    pub connection: ConnectionType,
    pub channel: ChannelId,
}

/// Per-face view of an endpoint's pools: which pool each face reaches, in
/// which direction, and on which channel.
pub struct Holder<P: Pool> {
    faces: HashMap<BlockFace, HolderFace<P>>,
}

impl<P: Pool> Holder<P> {
    pub fn new() -> Self {
        Self {
            faces: HashMap::new(),
        }
    }

    /// Every face exposes `pool` with `connection` on channel 0.
    pub fn uniform(pool: &Arc<P>, connection: ConnectionType) -> Self {
        BlockFace::ALL
            .into_iter()
            .fold(Self::new(), |holder, face| holder.with_face(face, pool, connection, 0))
    }

    pub fn with_face(
        mut self,
        face: BlockFace,
        pool: &Arc<P>,
        connection: ConnectionType,
        channel: ChannelId,
    ) -> Self {
        self.faces.insert(
            face,
            HolderFace {
                pool: Arc::clone(pool),
                connection,
                channel,
            },
        );
        self
    }

    pub fn face(&self, face: BlockFace) -> Option<&HolderFace<P>> {
        self.faces.get(&face)
    }

    pub fn connection(&self, face: BlockFace) -> ConnectionType {
        self.faces.get(&face).map_or(ConnectionType::None, |f| f.connection)
    }

    /// Connected faces with their channel assignment.
    pub fn channels(&self) -> Vec<(BlockFace, ChannelId)> {
        self.faces
            .iter()
            .filter(|(_, f)| f.connection != ConnectionType::None)
            .map(|(face, f)| (*face, f.channel))
            .collect()
    }
}

impl<P: Pool> Default for Holder<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Upper bound on redistribution passes per call.
const MAX_ROUNDS: usize = 8;

/// Splits each source's outflow evenly over the compatible targets of its
/// channel, spending at most the given budget.
pub struct PoolDistributor<P: Pool> {
    sources: Vec<(Arc<P>, ConnectionType)>,
    targets: Vec<(Arc<P>, ConnectionType)>,
}

impl<P: Pool> PoolDistributor<P> {
    pub fn new(members: &[(Arc<Holder<P>>, BlockFace)]) -> Self {
        let mut sources: Vec<(Arc<P>, ConnectionType)> = Vec::new();
        let mut targets: Vec<(Arc<P>, ConnectionType)> = Vec::new();
        for (holder, face) in members {
            let Some(face) = holder.face(*face) else {
                continue;
            };
            if face.connection.can_extract() && !sources.iter().any(|(p, _)| Arc::ptr_eq(p, &face.pool)) {
                sources.push((Arc::clone(&face.pool), face.connection));
            }
            if face.connection.can_insert() && !targets.iter().any(|(p, _)| Arc::ptr_eq(p, &face.pool)) {
                targets.push((Arc::clone(&face.pool), face.connection));
            }
        }
        Self { sources, targets }
    }

    fn move_round(&self, left: &mut u64) -> u64 {
        let mut moved = 0;
        for (source, source_connection) in &self.sources {
            if *left == 0 {
                break;
            }
            let Some(content) = source.content() else {
                continue;
            };
            let available = source.amount().min(*left);
            if available == 0 {
                continue;
            }

            let targets: Vec<&Arc<P>> = self
                .targets
                .iter()
                .filter(|(target, connection)| {
                    !Arc::ptr_eq(target, source)
                        && !(*connection == ConnectionType::Buffer && *source_connection == ConnectionType::Buffer)
                        && target.space_for(content) > 0
                })
                .map(|(target, _)| target)
                .collect();
            if targets.is_empty() {
                continue;
            }

            let share = (available / targets.len() as u64).max(1);
            for target in targets {
                let amount = share.min(*left).min(target.space_for(content));
                if amount == 0 {
                    continue;
                }
                let taken = source.extract(amount);
                if taken == 0 {
                    break;
                }
                let accepted = target.insert(content, taken);
                if accepted < taken {
                    source.insert(content, taken - accepted);
                }
                *left -= accepted;
                moved += accepted;
            }
        }
        moved
    }
}

impl<P: Pool> Distributor for PoolDistributor<P> {
    fn distribute(&mut self, budget: u64) -> u64 {
        let mut left = budget;
        for _ in 0..MAX_ROUNDS {
            if left == 0 || self.move_round(&mut left) == 0 {
                break;
            }
        }
        left
    }
}
