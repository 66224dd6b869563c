//! The chunked grid: construction, coloring, membership, query kernels and
//! the per-tick dispatch over color groups.

use crate::chunk::{Chunk, Resident};
use crate::geom::{self, Aabb};
use crate::organism::{Neighbor, Organism, OrganismId, StepContext};
use crate::scheduler::Scheduler;
use crate::world::World;
use glam::Vec3;
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;

/// Number of parity color groups; two chunks of one color are never in each
/// other's 1-ring.
pub const COLOR_GROUPS: usize = 8;

/// Distance kept between a precisely moved organism and the obstacle it
/// would otherwise contact.
const CONTACT_EPSILON: f32 = 0.01;
/// Additional margin subtracted when committing a precise move.
const MOVE_EPSILON: f32 = 1e-3;
/// Ratio of the parent radius used to offset division candidates.
const SPLIT_OFFSET_RATIO: f32 = 1.02;
/// Directions tried before a division attempt gives up for the tick.
const DIVISION_ATTEMPTS: usize = 5;

/// Stream constants for deriving per-batch generators from the master seed.
const TICK_STREAM_PRIME: u64 = 0x9E37_79B9_7F4A_7C15;
const BATCH_STREAM_PRIME: u64 = 0xD1B5_4A32_D192_ED03;

/// Errors raised by grid construction and membership operations.
#[derive(Debug, Error)]
pub enum GridError {
    /// Configuration values that cannot produce a sound grid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Operation the chunked grid deliberately does not implement.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// Organism radius outside the range the grid was built for.
    #[error("organism radius {radius} outside supported range (0, {max}]")]
    UnsupportedRadius { radius: f32, max: f32 },
    /// Position outside the world volume.
    #[error("position {position:?} lies outside the world bounds")]
    OutOfBounds { position: Vec3 },
    /// Query against an id the grid does not know.
    #[error("unknown organism id {0:?}")]
    UnknownOrganism(OrganismId),
    /// Worker pool construction failed.
    #[error("worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Counters emitted after a completed tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickStats {
    /// Tick number just completed; the first tick is 1.
    pub tick: u64,
    /// Organisms created by division during the tick.
    pub births: usize,
}

/// Public snapshot of one organism's spatial state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrganismSnapshot {
    pub id: OrganismId,
    pub kind: &'static str,
    pub position: Vec3,
    pub radius: f32,
    /// Cached bounding box, `[position - radius, position + radius]`.
    pub mbb: Aabb,
}

/// Chunks of one parity color plus their fixed partition across workers.
struct ColorGroup {
    chunks: Vec<usize>,
    batches: Vec<Vec<usize>>,
}

/// Uniform chunked grid stepping its population in eight color phases.
///
/// Construction fixes the chunk topology, the color groups and the per-color
/// batches for the life of the grid. Ticks are driven through [`step`], which
/// may be called from behind a shared reference (an `Arc` in applications);
/// a tick arriving while another is in flight is dropped.
///
/// [`step`]: ChunkedGrid::step
pub struct ChunkedGrid {
    world: World,
    min: Vec3,
    chunk_size: f32,
    largest_radius: f32,
    nx: usize,
    ny: usize,
    nz: usize,
    chunks: Vec<Chunk>,
    colors: Vec<ColorGroup>,
    scheduler: Scheduler,
    /// Owning chunk per organism, for external queries by id.
    directory: RwLock<HashMap<OrganismId, usize>>,
    /// Re-entrancy guard: set for the duration of one tick.
    stepping: AtomicBool,
    tick: AtomicU64,
    next_id: AtomicU64,
    population: AtomicUsize,
    births: AtomicUsize,
}

impl fmt::Debug for ChunkedGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedGrid")
            .field("dims", &(self.nx, self.ny, self.nz))
            .field("chunk_size", &self.chunk_size)
            .field("largest_radius", &self.largest_radius)
            .field("workers", &self.scheduler.workers())
            .field("organism_count", &self.organism_count())
            .finish()
    }
}

impl ChunkedGrid {
    /// Build a grid covering `world` with cubic chunks of edge `chunk_size`.
    ///
    /// `largest_radius` bounds the radius of every organism later inserted;
    /// the 1-ring query property requires `chunk_size >= 2 * largest_radius`.
    /// `workers == 0` resolves to one less than the logical core count.
    pub fn new(
        world: World,
        chunk_size: f32,
        largest_radius: f32,
        workers: usize,
    ) -> Result<Self, GridError> {
        if !(chunk_size > 0.0) {
            return Err(GridError::InvalidConfig("chunk_size must be positive"));
        }
        if !(largest_radius > 0.0) {
            return Err(GridError::InvalidConfig("largest_radius must be positive"));
        }
        if chunk_size / 2.0 < largest_radius {
            return Err(GridError::InvalidConfig(
                "chunk_size must be at least twice the largest organism radius",
            ));
        }
        let extent = world.max() - world.min();
        if extent.min_element() <= 0.0 {
            return Err(GridError::InvalidConfig(
                "world bounds must have positive extent on every axis",
            ));
        }
        if chunk_size > 10.0 * largest_radius {
            tracing::warn!(
                chunk_size,
                largest_radius,
                "chunks are much larger than the organisms they bucket; queries will scan sparse neighborhoods"
            );
        }

        let available = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        let workers = if workers == 0 {
            available.saturating_sub(1).max(1)
        } else {
            workers
        };
        if workers == 1 {
            tracing::warn!("parallel grid configured with a single worker; color phases add overhead without concurrency");
        }
        if workers > available {
            tracing::warn!(workers, available, "more workers than logical cores");
        }

        let min = world.min();
        let nx = Self::axis_chunks(extent.x, chunk_size);
        let ny = Self::axis_chunks(extent.y, chunk_size);
        let nz = Self::axis_chunks(extent.z, chunk_size);

        let mut chunks = Vec::with_capacity(nx * ny * nz);
        let mut groups: Vec<Vec<usize>> = (0..COLOR_GROUPS).map(|_| Vec::new()).collect();
        for i in 0..nx {
            for j in 0..ny {
                for k in 0..nz {
                    let center = min
                        + Vec3::new(i as f32 + 0.5, j as f32 + 0.5, k as f32 + 0.5) * chunk_size;
                    let neighbors = Self::neighbor_indices(i, j, k, nx, ny, nz);
                    let linear = chunks.len();
                    chunks.push(Chunk::new(center, neighbors));
                    groups[(i % 2) * 4 + (j % 2) * 2 + (k % 2)].push(linear);
                }
            }
        }

        let colors = groups
            .into_iter()
            .map(|chunks| {
                let batches = Self::partition_batches(&chunks, workers);
                ColorGroup { chunks, batches }
            })
            .collect();

        Ok(Self {
            world,
            min,
            chunk_size,
            largest_radius,
            nx,
            ny,
            nz,
            chunks,
            colors,
            scheduler: Scheduler::new(workers)?,
            directory: RwLock::new(HashMap::new()),
            stepping: AtomicBool::new(false),
            tick: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            population: AtomicUsize::new(0),
            births: AtomicUsize::new(0),
        })
    }

    fn axis_chunks(extent: f32, chunk_size: f32) -> usize {
        ((extent / chunk_size).ceil() as usize).max(1)
    }

    fn neighbor_indices(
        i: usize,
        j: usize,
        k: usize,
        nx: usize,
        ny: usize,
        nz: usize,
    ) -> Vec<usize> {
        let mut neighbors = Vec::with_capacity(26);
        for di in -1i64..=1 {
            for dj in -1i64..=1 {
                for dk in -1i64..=1 {
                    if di == 0 && dj == 0 && dk == 0 {
                        continue;
                    }
                    let (ni, nj, nk) = (i as i64 + di, j as i64 + dj, k as i64 + dk);
                    if ni < 0
                        || nj < 0
                        || nk < 0
                        || ni >= nx as i64
                        || nj >= ny as i64
                        || nk >= nz as i64
                    {
                        continue;
                    }
                    neighbors.push((ni as usize * ny + nj as usize) * nz + nk as usize);
                }
            }
        }
        neighbors
    }

    /// Split a color's chunk list across `workers` batches; the first
    /// `len % count` batches carry one chunk more than the rest.
    fn partition_batches(chunks: &[usize], workers: usize) -> Vec<Vec<usize>> {
        if chunks.is_empty() {
            return Vec::new();
        }
        let count = workers.min(chunks.len());
        let base = chunks.len() / count;
        let extra = chunks.len() % count;
        let mut batches = Vec::with_capacity(count);
        let mut cursor = 0;
        for batch in 0..count {
            let take = base + usize::from(batch < extra);
            batches.push(chunks[cursor..cursor + take].to_vec());
            cursor += take;
        }
        batches
    }

    /// The world boundary and policy flags.
    #[must_use]
    pub fn world(&self) -> &World {
        &self.world
    }

    /// Mutable world access, for flag changes between ticks.
    #[must_use]
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// Chunk edge length.
    #[must_use]
    pub fn chunk_size(&self) -> f32 {
        self.chunk_size
    }

    /// Largest organism radius the grid accepts.
    #[must_use]
    pub fn largest_radius(&self) -> f32 {
        self.largest_radius
    }

    /// Chunk counts along x, y and z.
    #[must_use]
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.nx, self.ny, self.nz)
    }

    /// Total number of chunks.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Borrow a chunk by linear index.
    #[must_use]
    pub fn chunk(&self, index: usize) -> &Chunk {
        &self.chunks[index]
    }

    /// Worker threads backing the scheduler.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.scheduler.workers()
    }

    /// Linear chunk indices belonging to a parity color.
    #[must_use]
    pub fn color_group(&self, color: usize) -> &[usize] {
        &self.colors[color].chunks
    }

    /// Fixed batch partition of a color group.
    #[must_use]
    pub fn color_batches(&self, color: usize) -> &[Vec<usize>] {
        &self.colors[color].batches
    }

    /// Completed tick count.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    /// Chunk owning `position` under the floor/clamp rule. The clamp handles
    /// positions sitting exactly on the world's upper faces.
    #[must_use]
    pub fn chunk_index_of(&self, position: Vec3) -> usize {
        let rel = (position - self.min) / self.chunk_size;
        let i = (rel.x.floor() as i64).clamp(0, self.nx as i64 - 1) as usize;
        let j = (rel.y.floor() as i64).clamp(0, self.ny as i64 - 1) as usize;
        let k = (rel.z.floor() as i64).clamp(0, self.nz as i64 - 1) as usize;
        (i * self.ny + j) * self.nz + k
    }

    /// Chunk currently holding `id`.
    pub fn chunk_of(&self, id: OrganismId) -> Result<usize, GridError> {
        self.directory
            .read()
            .get(&id)
            .copied()
            .ok_or(GridError::UnknownOrganism(id))
    }

    // ---- membership -----------------------------------------------------

    /// Insert `behaviour` at `position`, returning the organism's id.
    pub fn insert(
        &self,
        behaviour: Box<dyn Organism>,
        position: Vec3,
    ) -> Result<OrganismId, GridError> {
        let radius = behaviour.radius();
        if !(radius > 0.0) || radius > self.largest_radius {
            return Err(GridError::UnsupportedRadius {
                radius,
                max: self.largest_radius,
            });
        }
        if !self.world.contains(position) {
            return Err(GridError::OutOfBounds { position });
        }
        let id = OrganismId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let chunk = self.chunk_index_of(position);
        let tick_mark = self.tick.load(Ordering::Relaxed);
        self.chunks[chunk].push(Resident::new(id, position, radius, tick_mark, behaviour));
        self.directory.write().insert(id, chunk);
        self.population.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Remove an organism, returning its behaviour. `None` for ids the grid
    /// does not know. Meant to be called between ticks.
    pub fn remove(&self, id: OrganismId) -> Option<Box<dyn Organism>> {
        let chunk = *self.directory.read().get(&id)?;
        let resident = self.chunks[chunk].take(id)?;
        self.directory.write().remove(&id);
        self.population.fetch_sub(1, Ordering::Relaxed);
        resident.behaviour
    }

    /// Number of organisms resident in the grid.
    #[must_use]
    pub fn organism_count(&self) -> usize {
        self.population.load(Ordering::Relaxed)
    }

    /// Spatial snapshots of every organism, grouped by chunk.
    #[must_use]
    pub fn organisms(&self) -> Vec<OrganismSnapshot> {
        let mut snapshots = Vec::with_capacity(self.organism_count());
        for chunk in &self.chunks {
            let residents = chunk.residents();
            for resident in residents.iter() {
                if let Some(behaviour) = resident.behaviour.as_deref() {
                    snapshots.push(OrganismSnapshot {
                        id: resident.id,
                        kind: behaviour.kind(),
                        position: resident.position,
                        radius: resident.radius,
                        mbb: resident.mbb,
                    });
                }
            }
        }
        snapshots
    }

    /// Visit every organism with its behaviour, for persistence walks.
    /// Chunk read locks are held during the callback, so `visit` must not
    /// call back into membership or movement operations.
    pub fn for_each_organism<F>(&self, mut visit: F)
    where
        F: FnMut(OrganismSnapshot, &dyn Organism),
    {
        for chunk in &self.chunks {
            let residents = chunk.residents();
            for resident in residents.iter() {
                if let Some(behaviour) = resident.behaviour.as_deref() {
                    visit(
                        OrganismSnapshot {
                            id: resident.id,
                            kind: behaviour.kind(),
                            position: resident.position,
                            radius: resident.radius,
                            mbb: resident.mbb,
                        },
                        behaviour,
                    );
                }
            }
        }
    }

    fn locate(&self, id: OrganismId) -> Result<(usize, Vec3, f32), GridError> {
        let chunk = self.chunk_of(id)?;
        let residents = self.chunks[chunk].residents();
        let resident = residents
            .iter()
            .find(|r| r.id == id)
            .ok_or(GridError::UnknownOrganism(id))?;
        Ok((chunk, resident.position, resident.radius))
    }

    // ---- query kernels --------------------------------------------------

    /// Whether a sphere of the organism's radius centred at `probe` would
    /// leave the world or touch any other organism in the 1-ring.
    pub fn overlap(&self, id: OrganismId, probe: Vec3) -> Result<bool, GridError> {
        let (chunk, _, radius) = self.locate(id)?;
        Ok(self.overlap_in_ring(chunk, id, radius, probe))
    }

    /// Distance to first contact along `dir`, capped at `length`. See
    /// [`StepContext::first_hit`] for the return contract.
    pub fn first_hit(
        &self,
        id: OrganismId,
        dir: Vec3,
        length: f32,
    ) -> Result<Option<f32>, GridError> {
        let (chunk, position, radius) = self.locate(id)?;
        let unit = dir.normalize_or_zero();
        if unit == Vec3::ZERO || length <= 0.0 {
            return Ok(None);
        }
        Ok(self.first_hit_in_ring(chunk, id, radius, position, unit, length))
    }

    /// Closest other organism in the 1-ring of `id`'s chunk, if any. Bounded
    /// work: organisms outside the 1-ring are never considered.
    pub fn nearest_neighbor(&self, id: OrganismId) -> Result<Option<Neighbor>, GridError> {
        let (chunk, position, _) = self.locate(id)?;
        Ok(self.nearest_in_ring(chunk, id, position))
    }

    /// Ranged scans are not supported by the chunked grid; a hierarchical
    /// index is the right tool for unbounded-radius queries.
    pub fn organisms_within_range(
        &self,
        _id: OrganismId,
        _range: f32,
    ) -> Result<Vec<Neighbor>, GridError> {
        Err(GridError::Unsupported("organisms_within_range"))
    }

    fn ring_chunks(&self, chunk: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::once(chunk).chain(self.chunks[chunk].neighbors().iter().copied())
    }

    pub(crate) fn overlap_in_ring(
        &self,
        chunk: usize,
        skip: OrganismId,
        radius: f32,
        probe: Vec3,
    ) -> bool {
        if !self.world.contains(probe) {
            return true;
        }
        for index in self.ring_chunks(chunk) {
            let residents = self.chunks[index].residents();
            for resident in residents.iter() {
                if resident.id == skip {
                    continue;
                }
                if geom::spheres_touch(probe, radius, resident.position, resident.radius) {
                    return true;
                }
            }
        }
        false
    }

    pub(crate) fn first_hit_in_ring(
        &self,
        chunk: usize,
        skip: OrganismId,
        radius: f32,
        origin: Vec3,
        dir: Vec3,
        length: f32,
    ) -> Option<f32> {
        if !self.world.contains(origin + dir * length) {
            return Some(0.0);
        }
        let mut nearest: Option<f32> = None;
        for index in self.ring_chunks(chunk) {
            let residents = self.chunks[index].residents();
            for resident in residents.iter() {
                if resident.id == skip {
                    continue;
                }
                let reach = radius + resident.radius;
                if let Some(t) =
                    geom::ray_sphere_entry(origin, dir, resident.position, reach, length)
                {
                    if nearest.is_none_or(|current| t < current) {
                        nearest = Some(t);
                    }
                }
            }
        }
        nearest.map(|t| (t - CONTACT_EPSILON).max(0.0))
    }

    pub(crate) fn nearest_in_ring(
        &self,
        chunk: usize,
        skip: OrganismId,
        origin: Vec3,
    ) -> Option<Neighbor> {
        let mut best: Option<(OrderedFloat<f32>, Neighbor)> = None;
        for index in self.ring_chunks(chunk) {
            let residents = self.chunks[index].residents();
            for resident in residents.iter() {
                if resident.id == skip {
                    continue;
                }
                let dist_sq = OrderedFloat(origin.distance_squared(resident.position));
                if best.as_ref().is_none_or(|(current, _)| dist_sq < *current) {
                    best = Some((
                        dist_sq,
                        Neighbor {
                            id: resident.id,
                            position: resident.position,
                            radius: resident.radius,
                        },
                    ));
                }
            }
        }
        best.map(|(_, neighbor)| neighbor)
    }

    // ---- movement and division ------------------------------------------

    pub(crate) fn try_move(&self, ctx: &mut StepContext<'_>, dir: Vec3) -> bool {
        if self.world.precise_movement() {
            let length = dir.length();
            if length == 0.0 {
                return false;
            }
            let unit = dir / length;
            let contact = self
                .first_hit_in_ring(ctx.chunk, ctx.id, ctx.radius, ctx.position, unit, length)
                .unwrap_or(length);
            let travel = (contact - MOVE_EPSILON).max(0.0);
            if travel <= 0.0 {
                return false;
            }
            self.commit_position(ctx, ctx.position + unit * travel);
            true
        } else {
            if dir == Vec3::ZERO {
                return false;
            }
            let target = ctx.position + dir;
            if self.overlap_in_ring(ctx.chunk, ctx.id, ctx.radius, target) {
                return false;
            }
            self.commit_position(ctx, target);
            true
        }
    }

    /// Publish a new position: refresh the cached bounding box and re-bucket
    /// when the position crossed a chunk boundary. The destination chunk is
    /// always inside the source's 1-ring, so the push lands in a chunk no
    /// same-color worker is stepping.
    pub(crate) fn commit_position(&self, ctx: &mut StepContext<'_>, position: Vec3) {
        let target = self.chunk_index_of(position);
        let mbb = Aabb::from_sphere(position, ctx.radius);
        if target == ctx.chunk {
            let mut residents = self.chunks[ctx.chunk].residents_mut();
            if let Some(resident) = residents.iter_mut().find(|r| r.id == ctx.id) {
                resident.position = position;
                resident.mbb = mbb;
            }
        } else if let Some(mut resident) = self.chunks[ctx.chunk].take(ctx.id) {
            resident.position = position;
            resident.mbb = mbb;
            self.chunks[target].push(resident);
            self.directory.write().insert(ctx.id, target);
            ctx.chunk = target;
        }
        ctx.position = position;
    }

    pub(crate) fn reproduce(
        &self,
        ctx: &mut StepContext<'_>,
        parent: &mut dyn Organism,
    ) -> Option<OrganismId> {
        let offset = ctx.radius * SPLIT_OFFSET_RATIO;
        for _ in 0..DIVISION_ATTEMPTS {
            let dir = geom::random_unit_vector(ctx.rng);
            let near_plus = ctx.position + dir * offset;
            let near_minus = ctx.position - dir * offset;
            if !self.overlap_in_ring(ctx.chunk, ctx.id, ctx.radius, near_plus)
                && !self.overlap_in_ring(ctx.chunk, ctx.id, ctx.radius, near_minus)
            {
                // Symmetric split: child on one side, parent pushed to the
                // other. Checked before either commit so the pair cannot end
                // up interpenetrating.
                let child = self.spawn_child(ctx, parent, near_plus);
                self.commit_position(ctx, near_minus);
                return Some(child);
            }
            let far_plus = ctx.position + dir * (2.0 * offset);
            if !self.overlap_in_ring(ctx.chunk, ctx.id, ctx.radius, far_plus) {
                return Some(self.spawn_child(ctx, parent, far_plus));
            }
            let far_minus = ctx.position - dir * (2.0 * offset);
            if !self.overlap_in_ring(ctx.chunk, ctx.id, ctx.radius, far_minus) {
                return Some(self.spawn_child(ctx, parent, far_minus));
            }
        }
        None
    }

    fn spawn_child(
        &self,
        ctx: &mut StepContext<'_>,
        parent: &mut dyn Organism,
        position: Vec3,
    ) -> OrganismId {
        let behaviour = parent.create_child(&mut *ctx.rng);
        let radius = behaviour.radius();
        debug_assert!(
            radius > 0.0 && radius <= self.largest_radius,
            "child radius {radius} outside supported range"
        );
        let id = OrganismId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let chunk = self.chunk_index_of(position);
        // Marked with the in-flight tick: newborns first step next tick.
        let tick_mark = self.tick.load(Ordering::Relaxed);
        self.chunks[chunk].push(Resident::new(id, position, radius, tick_mark, behaviour));
        self.directory.write().insert(id, chunk);
        self.population.fetch_add(1, Ordering::Relaxed);
        self.births.fetch_add(1, Ordering::Relaxed);
        id
    }

    // ---- tick dispatch --------------------------------------------------

    /// Advance one tick: colors 0..7 in order, all batches of a color in
    /// parallel, a join barrier between colors.
    ///
    /// Returns `None` without touching any organism when a previous tick is
    /// still in flight. A panic inside an organism's `step` propagates and
    /// aborts the tick; completed batches are not rolled back.
    pub fn step(&self) -> Option<TickStats> {
        if self
            .stepping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("tick dropped: previous tick still in flight");
            return None;
        }
        let _clear = ClearOnDrop(&self.stepping);

        let tick = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        self.births.store(0, Ordering::Relaxed);

        let mut order_rng = self
            .world
            .randomized_execution_order()
            .then(|| SmallRng::seed_from_u64(batch_seed(self.world.seed(), tick, 0, 0)));

        for color in 0..COLOR_GROUPS {
            let group = &self.colors[color];
            if group.batches.is_empty() {
                continue;
            }
            let mut batches: Vec<(usize, &[usize])> = group
                .batches
                .iter()
                .enumerate()
                .map(|(index, chunks)| (index, chunks.as_slice()))
                .collect();
            if let Some(rng) = order_rng.as_mut() {
                // Execution order only; batch identity, and with it the
                // per-batch generator derivation, is unaffected.
                batches.shuffle(rng);
            }
            self.scheduler.run_color(&batches, |batch, chunks| {
                let mut rng =
                    SmallRng::seed_from_u64(batch_seed(self.world.seed(), tick, color + 1, batch));
                for &chunk in chunks {
                    self.step_chunk(chunk, tick, &mut rng);
                }
            });
        }

        Some(TickStats {
            tick,
            births: self.births.load(Ordering::Relaxed),
        })
    }

    /// Step every organism resident in `chunk` at entry. Organisms inserted
    /// during the iteration are not stepped; organisms that migrated away
    /// are skipped when no longer found; organisms whose tick mark is
    /// current (newborns, forward migrants from an earlier color) are
    /// skipped so nothing steps twice in one tick.
    fn step_chunk(&self, chunk: usize, tick: u64, rng: &mut SmallRng) {
        for id in self.chunks[chunk].roster() {
            let Some((mut behaviour, position, radius)) = self.begin_step(chunk, id, tick) else {
                continue;
            };
            let mut ctx = StepContext {
                grid: self,
                id,
                chunk,
                position,
                radius,
                rng: &mut *rng,
            };
            behaviour.step(&mut ctx);
            let home = ctx.chunk;
            self.finish_step(home, id, behaviour);
        }
    }

    fn begin_step(
        &self,
        chunk: usize,
        id: OrganismId,
        tick: u64,
    ) -> Option<(Box<dyn Organism>, Vec3, f32)> {
        let mut residents = self.chunks[chunk].residents_mut();
        let resident = residents.iter_mut().find(|r| r.id == id)?;
        if resident.tick_mark >= tick {
            return None;
        }
        resident.tick_mark = tick;
        Some((resident.behaviour.take()?, resident.position, resident.radius))
    }

    fn finish_step(&self, chunk: usize, id: OrganismId, behaviour: Box<dyn Organism>) {
        let mut residents = self.chunks[chunk].residents_mut();
        if let Some(resident) = residents.iter_mut().find(|r| r.id == id) {
            resident.behaviour = Some(behaviour);
        }
    }
}

/// Clears the stepping flag even when a tick aborts by panic.
struct ClearOnDrop<'a>(&'a AtomicBool);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Derive an independent generator stream for `(tick, color, batch)` from
/// the master seed.
fn batch_seed(seed: u64, tick: u64, color: usize, batch: usize) -> u64 {
    seed.wrapping_add(tick.wrapping_mul(TICK_STREAM_PRIME)).wrapping_add(
        (((color as u64) << 32) | batch as u64).wrapping_mul(BATCH_STREAM_PRIME),
    )
}
