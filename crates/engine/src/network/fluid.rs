use std::sync::Arc;

use parking_lot::Mutex;

use super::pool::{Holder, Pool, PoolDistributor};
use super::resource::{Distributor, NetworkKind, ResourceNetwork};
use super::{ChannelId, NetworkEndPoint, NetworkType};
use crate::world::position::BlockFace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FluidType {
    Water,
    Lava,
}

impl FluidType {
    pub fn name(self) -> &'static str {
        match self {
            FluidType::Water => "water",
            FluidType::Lava => "lava",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "water" => Some(FluidType::Water),
            "lava" => Some(FluidType::Lava),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct FluidState {
    ty: Option<FluidType>,
    amount: u64,
}

/// A tank of a single fluid type at a time. Forgets its type when drained.
#[derive(Debug)]
pub struct FluidContainer {
    capacity: u64,
    state: Mutex<FluidState>,
}

impl FluidContainer {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(FluidState::default()),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn fluid_type(&self) -> Option<FluidType> {
        self.state.lock().ty
    }

    /// Replace the contents, clamped to capacity.
    pub fn set(&self, ty: Option<FluidType>, amount: u64) {
        let amount = if ty.is_some() { amount.min(self.capacity) } else { 0 };
        let mut state = self.state.lock();
        state.amount = amount;
        state.ty = if amount > 0 { ty } else { None };
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().amount >= self.capacity
    }
}

impl Pool for FluidContainer {
    type Content = FluidType;

    fn content(&self) -> Option<FluidType> {
        let state = self.state.lock();
        state.ty.filter(|_| state.amount > 0)
    }

    fn amount(&self) -> u64 {
        self.state.lock().amount
    }

    fn space_for(&self, content: FluidType) -> u64 {
        let state = self.state.lock();
        match state.ty {
            Some(ty) if ty != content && state.amount > 0 => 0,
            _ => self.capacity - state.amount,
        }
    }

    fn extract(&self, max: u64) -> u64 {
        let mut state = self.state.lock();
        let taken = max.min(state.amount);
        state.amount -= taken;
        if state.amount == 0 {
            state.ty = None;
        }
        taken
    }

    fn insert(&self, content: FluidType, amount: u64) -> u64 {
        let mut state = self.state.lock();
        if state.ty.is_some_and(|ty| ty != content) && state.amount > 0 {
            return 0;
        }
        let accepted = amount.min(self.capacity - state.amount);
        if accepted > 0 {
            state.ty = Some(content);
            state.amount += accepted;
        }
        accepted
    }
}

pub type FluidHolder = Holder<FluidContainer>;

pub struct FluidKind;

impl NetworkKind for FluidKind {
    const TYPE: NetworkType = NetworkType::Fluid;
    type Holder = FluidHolder;

    fn holder(endpoint: &dyn NetworkEndPoint) -> Option<Arc<FluidHolder>> {
        endpoint.fluid_holder()
    }

    fn channels(holder: &FluidHolder) -> Vec<(BlockFace, ChannelId)> {
        holder.channels()
    }

    fn distributor(members: &[(Arc<FluidHolder>, BlockFace)]) -> Box<dyn Distributor> {
        Box::new(PoolDistributor::new(members))
    }
}

pub type FluidNetwork = ResourceNetwork<FluidKind>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ConnectionType;

    #[test]
    fn container_keeps_one_type() {
        let tank = FluidContainer::new(100);
        assert_eq!(tank.insert(FluidType::Water, 60), 60);
        assert_eq!(tank.space_for(FluidType::Lava), 0);
        assert_eq!(tank.insert(FluidType::Lava, 10), 0);
        assert_eq!(tank.insert(FluidType::Water, 60), 40);
        assert!(tank.is_full());

        assert_eq!(tank.extract(150), 100);
        assert_eq!(tank.fluid_type(), None);
        assert_eq!(tank.space_for(FluidType::Lava), 100);
    }

    #[test]
    fn distributor_splits_evenly() {
        let source = Arc::new(FluidContainer::new(1000));
        source.set(Some(FluidType::Water), 1000);
        let a = Arc::new(FluidContainer::new(1000));
        let b = Arc::new(FluidContainer::new(1000));

        let members = vec![
            (Arc::new(FluidHolder::uniform(&source, ConnectionType::Extract)), BlockFace::Up),
            (Arc::new(FluidHolder::uniform(&a, ConnectionType::Insert)), BlockFace::Down),
            (Arc::new(FluidHolder::uniform(&b, ConnectionType::Insert)), BlockFace::Down),
        ];
        let mut distributor = PoolDistributor::new(&members);

        assert_eq!(distributor.distribute(100), 0);
        assert_eq!(a.amount(), 50);
        assert_eq!(b.amount(), 50);
        assert_eq!(source.amount(), 900);
    }

    #[test]
    fn buffers_do_not_feed_each_other() {
        let a = Arc::new(FluidContainer::new(100));
        a.set(Some(FluidType::Water), 100);
        let b = Arc::new(FluidContainer::new(100));

        let members = vec![
            (Arc::new(FluidHolder::uniform(&a, ConnectionType::Buffer)), BlockFace::Up),
            (Arc::new(FluidHolder::uniform(&b, ConnectionType::Buffer)), BlockFace::Down),
        ];
        let mut distributor = PoolDistributor::new(&members);

        assert_eq!(distributor.distribute(50), 50);
        assert_eq!(b.amount(), 0);
    }
}
