//! A cubic cell of the uniform grid and the organisms resident in it.

use crate::geom::Aabb;
use crate::organism::{Organism, OrganismId};
use glam::Vec3;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// An organism as stored by its owning chunk: spatial state plus behaviour.
pub(crate) struct Resident {
    pub id: OrganismId,
    pub position: Vec3,
    pub radius: f32,
    /// Derived cache, kept equal to `[position - radius, position + radius]`
    /// at every observable point.
    pub mbb: Aabb,
    /// Last tick this organism stepped in, or the tick it appeared in.
    /// Guards against double-stepping an organism that migrates into a chunk
    /// whose color phase has not run yet, and against stepping newborns in
    /// their birth tick.
    pub tick_mark: u64,
    /// Taken out while this organism's own `step` runs.
    pub behaviour: Option<Box<dyn Organism>>,
}

impl Resident {
    pub fn new(
        id: OrganismId,
        position: Vec3,
        radius: f32,
        tick_mark: u64,
        behaviour: Box<dyn Organism>,
    ) -> Self {
        Self {
            id,
            position,
            radius,
            mbb: Aabb::from_sphere(position, radius),
            tick_mark,
            behaviour: Some(behaviour),
        }
    }
}

/// One cubic cell of the grid.
///
/// Residents sit behind an `RwLock`. The eight-color schedule keeps write
/// access effectively single-owner: while a color runs, a chunk is written
/// only by its own worker, or briefly by an adjacent worker pushing a
/// migrating or newborn organism. Concurrent same-color workers may read the
/// chunk as part of their 1-ring, which is why the lock exists at all.
pub struct Chunk {
    center: Vec3,
    neighbors: Vec<usize>,
    residents: RwLock<Vec<Resident>>,
}

impl Chunk {
    pub(crate) fn new(center: Vec3, neighbors: Vec<usize>) -> Self {
        Self {
            center,
            neighbors,
            residents: RwLock::new(Vec::new()),
        }
    }

    /// Center of the cell in world coordinates.
    #[must_use]
    pub fn center(&self) -> Vec3 {
        self.center
    }

    /// Indices of the up-to-26 chunks sharing a face, edge or corner.
    #[must_use]
    pub fn neighbors(&self) -> &[usize] {
        &self.neighbors
    }

    /// Number of organisms currently resident.
    #[must_use]
    pub fn len(&self) -> usize {
        self.residents.read().len()
    }

    /// Whether the chunk holds no organisms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.residents.read().is_empty()
    }

    /// Ids of the organisms resident right now, in insertion order. Stepping
    /// snapshots this at chunk entry so organisms inserted mid-iteration are
    /// not stepped in the same tick.
    pub(crate) fn roster(&self) -> Vec<OrganismId> {
        self.residents.read().iter().map(|r| r.id).collect()
    }

    /// Append a resident. No deduplication.
    pub(crate) fn push(&self, resident: Resident) {
        self.residents.write().push(resident);
    }

    /// Remove the first resident with `id`, preserving insertion order.
    pub(crate) fn take(&self, id: OrganismId) -> Option<Resident> {
        let mut residents = self.residents.write();
        let index = residents.iter().position(|r| r.id == id)?;
        Some(residents.remove(index))
    }

    pub(crate) fn residents(&self) -> RwLockReadGuard<'_, Vec<Resident>> {
        self.residents.read()
    }

    pub(crate) fn residents_mut(&self) -> RwLockWriteGuard<'_, Vec<Resident>> {
        self.residents.write()
    }
}
