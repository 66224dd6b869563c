//! Simulation layer over the chunked grid: validated configuration, seeding,
//! tick summaries, and the registry used to decode persisted organisms.

mod cell;

pub use cell::{DriftCell, DRIFT_CELL_KIND};
pub use primordium_index::{
    Aabb, ChunkedGrid, EncodeError, GridError, Neighbor, Organism, OrganismId, OrganismSnapshot,
    StepContext, TickStats, Vec3, World,
};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use thiserror::Error;

/// Errors raised when building or driving a simulation.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Error surfaced by the underlying grid.
    #[error(transparent)]
    Grid(#[from] GridError),
    /// Import met an organism kind with no registered decoder.
    #[error("no decoder registered for organism kind `{0}`")]
    UnknownKind(String),
    /// A registered decoder rejected its payload.
    #[error("failed to decode organism payload: {0}")]
    Decode(String),
    /// An organism failed to serialize during export.
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Static configuration for a primordium world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Lower corner of the world volume.
    pub world_min: [f32; 3],
    /// Upper corner of the world volume.
    pub world_max: [f32; 3],
    /// Edge length of one cubic chunk.
    pub chunk_size: f32,
    /// Upper bound on organism radii; chunks must be at least twice this.
    pub largest_radius: f32,
    /// Worker threads for the color scheduler; 0 resolves to cores - 1.
    pub workers: usize,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Walk movers up to first contact instead of rejecting blocked moves.
    pub precise_movement: bool,
    /// Shuffle batch execution order each tick.
    pub randomized_execution_order: bool,
    /// Maximum number of recent tick summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            world_min: [0.0; 3],
            world_max: [64.0; 3],
            chunk_size: 4.0,
            largest_radius: 1.0,
            workers: 0,
            rng_seed: None,
            precise_movement: false,
            randomized_execution_order: false,
            history_capacity: 256,
        }
    }
}

impl SimulationConfig {
    /// Validates configuration values the grid cannot check itself.
    fn validate(&self) -> Result<(), SimulationError> {
        for axis in 0..3 {
            if self.world_min[axis] >= self.world_max[axis] {
                return Err(SimulationError::InvalidConfig(
                    "world_min must be strictly below world_max on every axis",
                ));
            }
        }
        if self.history_capacity == 0 {
            return Err(SimulationError::InvalidConfig(
                "history_capacity must be positive",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG seed, generating one from entropy if
    /// absent.
    fn seeded(&self) -> u64 {
        self.rng_seed.unwrap_or_else(rand::random)
    }
}

/// Per-tick aggregate retained in the history ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: u64,
    pub organism_count: usize,
    pub births: usize,
}

/// Decoder registry keyed by organism kind tags.
///
/// Organisms serialize themselves to opaque strings; the registry maps each
/// kind tag back to a factory able to rebuild the behaviour object.
#[derive(Default)]
pub struct KindRegistry {
    decoders: HashMap<&'static str, Box<DecodeFn>>,
}

type DecodeFn = dyn Fn(&str) -> Result<Box<dyn Organism>, String> + Send + Sync;

impl fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindRegistry")
            .field("decoder_count", &self.decoders.len())
            .finish()
    }
}

impl KindRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a decoder for `kind`, replacing any previous one.
    pub fn register<F>(&mut self, kind: &'static str, decode: F)
    where
        F: Fn(&str) -> Result<Box<dyn Organism>, String> + Send + Sync + 'static,
    {
        self.decoders.insert(kind, Box::new(decode));
    }

    /// Returns whether a kind has a decoder.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    /// Rebuild a behaviour object from its kind tag and payload.
    pub fn decode(&self, kind: &str, payload: &str) -> Result<Box<dyn Organism>, SimulationError> {
        let decoder = self
            .decoders
            .get(kind)
            .ok_or_else(|| SimulationError::UnknownKind(kind.to_owned()))?;
        decoder(payload).map_err(SimulationError::Decode)
    }
}

/// Serialized organism row produced by [`Simulation::export`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganismRecord {
    pub kind: String,
    pub payload: String,
    pub position: [f32; 3],
}

/// Owns a grid plus the plumbing around it: seeding, summaries and
/// persistence.
pub struct Simulation {
    config: SimulationConfig,
    grid: ChunkedGrid,
    registry: KindRegistry,
    seed: u64,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("seed", &self.seed)
            .field("tick", &self.grid.ticks())
            .field("organism_count", &self.grid.organism_count())
            .finish()
    }
}

impl Simulation {
    /// Instantiate a simulation from the supplied configuration.
    pub fn new(config: SimulationConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        let seed = config.seeded();
        let mut world = World::new(
            Vec3::from(config.world_min),
            Vec3::from(config.world_max),
            seed,
        );
        world.set_precise_movement(config.precise_movement);
        world.set_randomized_execution_order(config.randomized_execution_order);
        let grid = ChunkedGrid::new(world, config.chunk_size, config.largest_radius, config.workers)?;
        tracing::debug!(seed, workers = grid.workers(), "simulation ready");

        let mut registry = KindRegistry::new();
        DriftCell::register(&mut registry);

        Ok(Self {
            history: VecDeque::with_capacity(config.history_capacity),
            config,
            grid,
            registry,
            seed,
        })
    }

    /// Place an organism, returning its id.
    pub fn spawn(
        &mut self,
        organism: Box<dyn Organism>,
        position: Vec3,
    ) -> Result<OrganismId, SimulationError> {
        Ok(self.grid.insert(organism, position)?)
    }

    /// Remove an organism, returning its behaviour when found at rest.
    pub fn remove(&mut self, id: OrganismId) -> Option<Box<dyn Organism>> {
        self.grid.remove(id)
    }

    /// Advance one tick and record its summary. `None` when the grid dropped
    /// the tick because a previous one was still in flight.
    pub fn step(&mut self) -> Option<TickSummary> {
        let stats = self.grid.step()?;
        let summary = TickSummary {
            tick: stats.tick,
            organism_count: self.grid.organism_count(),
            births: stats.births,
        };
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        Some(summary)
    }

    /// Number of live organisms.
    #[must_use]
    pub fn organism_count(&self) -> usize {
        self.grid.organism_count()
    }

    /// Read-only access to the underlying grid.
    #[must_use]
    pub fn grid(&self) -> &ChunkedGrid {
        &self.grid
    }

    /// Mutable grid access, for world flag changes between ticks.
    #[must_use]
    pub fn grid_mut(&mut self) -> &mut ChunkedGrid {
        &mut self.grid
    }

    /// Immutable access to the decoder registry.
    #[must_use]
    pub fn registry(&self) -> &KindRegistry {
        &self.registry
    }

    /// Mutable access to the decoder registry.
    #[must_use]
    pub fn registry_mut(&mut self) -> &mut KindRegistry {
        &mut self.registry
    }

    /// The master seed this run was created with.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Serialize every organism to a kind-tagged record. Fails on the first
    /// organism whose state does not serialize.
    pub fn export(&self) -> Result<Vec<OrganismRecord>, SimulationError> {
        let mut records = Vec::with_capacity(self.grid.organism_count());
        let mut failure: Option<EncodeError> = None;
        self.grid.for_each_organism(|snapshot, behaviour| {
            if failure.is_some() {
                return;
            }
            match behaviour.encode() {
                Ok(payload) => records.push(OrganismRecord {
                    kind: snapshot.kind.to_owned(),
                    payload,
                    position: snapshot.position.to_array(),
                }),
                Err(err) => failure = Some(err),
            }
        });
        match failure {
            Some(err) => Err(err.into()),
            None => Ok(records),
        }
    }

    /// Rebuild organisms from exported records, returning their new ids.
    pub fn import(
        &mut self,
        records: &[OrganismRecord],
    ) -> Result<Vec<OrganismId>, SimulationError> {
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let behaviour = self.registry.decode(&record.kind, &record.payload)?;
            ids.push(self.grid.insert(behaviour, Vec3::from(record.position))?);
        }
        Ok(ids)
    }
}
