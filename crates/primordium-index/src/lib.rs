//! Chunked spatial indexing and parallel stepping for spherical organisms.
//!
//! The grid partitions an axis-aligned world volume into cubic chunks, keeps
//! every organism bucketed in the chunk owning its position, and advances the
//! population in discrete ticks. Chunks are colored by coordinate parity into
//! eight groups; chunks of one color are never in each other's 1-ring, so all
//! batches of a color can step concurrently while their collision, ray and
//! nearest-neighbor queries stay confined to disjoint neighborhoods.

mod chunk;
mod geom;
mod grid;
mod organism;
mod scheduler;
mod world;

pub use chunk::Chunk;
pub use geom::Aabb;
pub use grid::{ChunkedGrid, GridError, OrganismSnapshot, TickStats, COLOR_GROUPS};
pub use organism::{EncodeError, Neighbor, Organism, OrganismId, StepContext};
pub use world::World;

pub use glam::Vec3;
