//! Server settings, read from `voxtile.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use voxtile_engine::network::NetworkConfig;
use voxtile_engine::world::position::WorldBounds;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Lowest block y. Must be a multiple of 16.
    pub min_y: i32,
    /// World height in blocks. Must be a positive multiple of 16.
    pub height: u32,
    /// Random-tick samples per section per tick.
    pub random_tick_speed: u32,
    /// Host ticks per second.
    pub tick_rate: f64,
    pub autosave_secs: u64,
    pub network: NetworkConfig,
}

impl Default for Config {
    fn default() -> Self {
        let bounds = WorldBounds::default();
        Self {
            min_y: bounds.min_y,
            height: bounds.height,
            random_tick_speed: 3,
            tick_rate: 20.0,
            autosave_secs: 300,
            network: NetworkConfig::default(),
        }
    }
}

impl Config {
    /// Read `path`, falling back to the defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.min_y % 16 == 0, "min_y {} is not a multiple of 16", self.min_y);
        anyhow::ensure!(
            self.height > 0 && self.height % 16 == 0,
            "height {} is not a positive multiple of 16",
            self.height
        );
        anyhow::ensure!(
            self.tick_rate.is_finite() && self.tick_rate > 0.0,
            "tick_rate must be positive"
        );
        for (name, network) in [("fluid", &self.network.fluid), ("energy", &self.network.energy)] {
            anyhow::ensure!(network.tick_delay > 0, "network.{name}.tick_delay must be positive");
        }
        Ok(())
    }

    pub fn bounds(&self) -> WorldBounds {
        WorldBounds::new(self.min_y, self.height)
    }

    /// Wall-clock time between two host ticks.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate)
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_secs.max(1))
    }
}
