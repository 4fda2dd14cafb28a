use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::DEFAULT_TICK_RATE;
use super::cancel::CancelToken;
use crate::host::Host;
use crate::world::entity::NativeEntity;

/// Target period between two async ticks of an entity ticking `rate` times
/// per second, stretched by the host's configured tick rate relative to 20
/// ticks/s: a 40 tick/s host doubles the period, a 10 tick/s host halves it.
/// `None` if `rate` disables ticking.
pub fn async_tick_interval(rate: f64, host_tick_rate: f64) -> Option<Duration> {
    if !rate.is_finite() || rate <= 0.0 {
        return None;
    }
    let ms = (1000.0 / rate * (host_tick_rate / DEFAULT_TICK_RATE)).round();
    Some(Duration::from_millis(ms.max(0.0) as u64))
}

/// Spawn the self-pacing async loop for `entity` under `token`.
///
/// Returns `None` if the entity does not tick asynchronously.
pub fn spawn_async_ticker(
    runtime: &Handle,
    entity: Arc<dyn NativeEntity>,
    token: CancelToken,
    host: Arc<dyn Host>,
) -> Option<JoinHandle<()>> {
    async_tick_interval(entity.async_tick_rate(), host.tick_rate())?;
    Some(runtime.spawn(run_async_ticker(entity, token, host)))
}

async fn run_async_ticker(entity: Arc<dyn NativeEntity>, token: CancelToken, host: Arc<dyn Host>) {
    let pos = entity.pos();
    loop {
        let start = Instant::now();

        {
            let Some(_entered) = token.enter() else {
                break;
            };
            if let Err(e) = entity.handle_async_tick() {
                tracing::error!("Async tick of tile entity at {:?} failed: {:#}", pos, e);
            }
        }

        let Some(interval) = async_tick_interval(entity.async_tick_rate(), host.tick_rate()) else {
            break;
        };
        // Late ticks are not made up: an overrun just starts the next one now.
        match interval.checked_sub(start.elapsed()) {
            Some(delay) if !delay.is_zero() => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => break,
                }
            }
            _ => tokio::task::yield_now().await,
        }
    }
    tracing::debug!("Async ticker for tile entity at {:?} stopped", pos);
}
