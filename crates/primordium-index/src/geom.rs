//! Sphere and ray geometry backing the query kernels.

use glam::Vec3;
use rand::rngs::SmallRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Axis-aligned box caching an organism's extent, `[pos - r, pos + r]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Bounding box of a sphere.
    #[must_use]
    pub fn from_sphere(center: Vec3, radius: f32) -> Self {
        Self {
            min: center - Vec3::splat(radius),
            max: center + Vec3::splat(radius),
        }
    }

    /// Whether `point` lies inside the box, faces inclusive.
    #[must_use]
    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }
}

/// True when spheres `(a, ra)` and `(b, rb)` touch or interpenetrate.
#[inline]
#[must_use]
pub(crate) fn spheres_touch(a: Vec3, ra: f32, b: Vec3, rb: f32) -> bool {
    let reach = ra + rb;
    a.distance_squared(b) <= reach * reach
}

/// Smallest non-negative ray parameter at which `origin + t * dir` enters the
/// sphere `(center, radius)`, if one exists within `max_t`. `dir` must be a
/// unit vector, so the quadratic's leading coefficient is 1.
#[must_use]
pub(crate) fn ray_sphere_entry(
    origin: Vec3,
    dir: Vec3,
    center: Vec3,
    radius: f32,
    max_t: f32,
) -> Option<f32> {
    let offset = origin - center;
    let b = 2.0 * offset.dot(dir);
    let c = offset.dot(offset) - radius * radius;
    let discriminant = b * b - 4.0 * c;
    if discriminant < 0.0 {
        return None;
    }
    let root = discriminant.sqrt();
    let near = (-b - root) / 2.0;
    let t = if near >= 0.0 { near } else { (-b + root) / 2.0 };
    (t >= 0.0 && t <= max_t).then_some(t)
}

/// Uniformly distributed unit direction, sampled as a latitude
/// `arccos(2u - 1) - pi/2` and a longitude `2 * pi * v`.
#[must_use]
pub(crate) fn random_unit_vector(rng: &mut SmallRng) -> Vec3 {
    use std::f32::consts::{FRAC_PI_2, TAU};
    let u: f32 = rng.random();
    let v: f32 = rng.random();
    let lat = (2.0 * u - 1.0).acos() - FRAC_PI_2;
    let lon = TAU * v;
    Vec3::new(lat.cos() * lon.cos(), lat.cos() * lon.sin(), lat.sin())
}
