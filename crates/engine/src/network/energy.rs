use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::pool::{Holder, Pool, PoolDistributor};
use super::resource::{Distributor, NetworkKind, ResourceNetwork};
use super::{ChannelId, NetworkEndPoint, NetworkType};
use crate::world::position::BlockFace;

/// A bounded energy buffer.
#[derive(Debug)]
pub struct EnergyStore {
    capacity: u64,
    energy: AtomicU64,
}

impl EnergyStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            energy: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn set(&self, energy: u64) {
        self.energy.store(energy.min(self.capacity), Ordering::Release);
    }
}

impl Pool for EnergyStore {
    type Content = ();

    fn content(&self) -> Option<()> {
        (self.amount() > 0).then_some(())
    }

    fn amount(&self) -> u64 {
        self.energy.load(Ordering::Acquire)
    }

    fn space_for(&self, _: ()) -> u64 {
        self.capacity.saturating_sub(self.amount())
    }

    fn extract(&self, max: u64) -> u64 {
        let previous = self
            .energy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |e| Some(e - e.min(max)))
            .unwrap_or_else(|e| e);
        previous.min(max)
    }

    fn insert(&self, _: (), amount: u64) -> u64 {
        let capacity = self.capacity;
        let previous = self
            .energy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |e| {
                Some(e + amount.min(capacity.saturating_sub(e)))
            })
            .unwrap_or_else(|e| e);
        amount.min(capacity.saturating_sub(previous))
    }
}

pub type EnergyHolder = Holder<EnergyStore>;

pub struct EnergyKind;

impl NetworkKind for EnergyKind {
    const TYPE: NetworkType = NetworkType::Energy;
    type Holder = EnergyHolder;

    fn holder(endpoint: &dyn NetworkEndPoint) -> Option<Arc<EnergyHolder>> {
        endpoint.energy_holder()
    }

    fn channels(holder: &EnergyHolder) -> Vec<(BlockFace, ChannelId)> {
        holder.channels()
    }

    fn distributor(members: &[(Arc<EnergyHolder>, BlockFace)]) -> Box<dyn Distributor> {
        Box::new(PoolDistributor::new(members))
    }
}

pub type EnergyNetwork = ResourceNetwork<EnergyKind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_is_bounded() {
        let store = EnergyStore::new(100);
        assert_eq!(store.insert((), 70), 70);
        assert_eq!(store.insert((), 70), 30);
        assert_eq!(store.extract(40), 40);
        assert_eq!(store.amount(), 60);
        assert_eq!(store.extract(100), 60);
        assert_eq!(store.content(), None);
    }
}
