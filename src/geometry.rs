// src/geometry.rs - Positions, vectors and bounding volumes
use serde::{Deserialize, Serialize};

/// Machine-absolute coordinates plus cumulative extrusion.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AbsolutePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
}

impl AbsolutePosition {
    pub const ORIGIN: Self = Self { x: 0.0, y: 0.0, z: 0.0, e: 0.0 };

    pub fn new(x: f64, y: f64, z: f64, e: f64) -> Self {
        Self { x, y, z, e }
    }

    /// Euclidean XYZ distance, extrusion ignored.
    pub fn distance_to(&self, other: &AbsolutePosition) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        let dz = other.z - self.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn xyz(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

/// A vector where every component is optional. Missing components mean
/// "leave this axis alone" when turned into a move.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x: Some(x), y: Some(y), z: Some(z) }
    }

    pub fn xy(x: f64, y: f64) -> Self {
        Self { x: Some(x), y: Some(y), z: None }
    }

    pub fn z(z: f64) -> Self {
        Self { x: None, y: None, z: Some(z) }
    }

    pub fn x(x: f64) -> Self {
        Self { x: Some(x), y: None, z: None }
    }

    pub fn y(y: f64) -> Self {
        Self { x: None, y: Some(y), z: None }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Fill in missing components from `defaults`.
    pub fn defaulting_to(&self, defaults: &Vector3) -> Vector3 {
        Vector3 {
            x: self.x.or(defaults.x),
            y: self.y.or(defaults.y),
            z: self.z.or(defaults.z),
        }
    }

    pub fn adjusting_z(&self, delta: f64) -> Vector3 {
        Vector3 { z: Some(self.z.unwrap_or(0.0) + delta), ..*self }
    }

    /// Distance between two vectors; missing components count as zero.
    pub fn distance_to(&self, other: &Vector3) -> f64 {
        let d = |a: Option<f64>, b: Option<f64>| b.unwrap_or(0.0) - a.unwrap_or(0.0);
        let (dx, dy, dz) = (d(self.x, other.x), d(self.y, other.y), d(self.z, other.z));
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Axis-aligned bounding volume.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Cuboid {
    pub origin: [f64; 3],
    pub size: [f64; 3],
}

impl Cuboid {
    pub fn new(origin: [f64; 3], size: [f64; 3]) -> Self {
        Self { origin, size }
    }

    /// Smallest cuboid containing both corners.
    pub fn from_corners(a: [f64; 3], b: [f64; 3]) -> Self {
        let mut origin = [0.0; 3];
        let mut size = [0.0; 3];
        for axis in 0..3 {
            origin[axis] = a[axis].min(b[axis]);
            size[axis] = (a[axis] - b[axis]).abs();
        }
        Self { origin, size }
    }

    pub fn max(&self) -> [f64; 3] {
        [
            self.origin[0] + self.size[0],
            self.origin[1] + self.size[1],
            self.origin[2] + self.size[2],
        ]
    }

    /// True when `other` lies fully inside this cuboid, allowing for
    /// floating point noise.
    pub fn contains(&self, other: &Cuboid) -> bool {
        const EPSILON: f64 = 1e-6;
        let (outer_max, inner_max) = (self.max(), other.max());
        (0..3).all(|axis| {
            other.origin[axis] >= self.origin[axis] - EPSILON
                && inner_max[axis] <= outer_max[axis] + EPSILON
        })
    }

    pub fn center(&self) -> [f64; 3] {
        [
            self.origin[0] + self.size[0] / 2.0,
            self.origin[1] + self.size[1] / 2.0,
            self.origin[2] + self.size[2] / 2.0,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cuboid_contains() {
        let volume = Cuboid::new([0.0, 0.0, 0.0], [100.0, 100.0, 100.0]);
        assert!(volume.contains(&Cuboid::new([10.0, 10.0, 0.0], [50.0, 50.0, 20.0])));
        assert!(!volume.contains(&Cuboid::new([60.0, 10.0, 0.0], [50.0, 50.0, 20.0])));
        assert!(!volume.contains(&Cuboid::new([-1.0, 0.0, 0.0], [5.0, 5.0, 5.0])));
    }

    #[test]
    fn test_vector_defaults() {
        let v = Vector3::z(5.0).defaulting_to(&Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(v, Vector3::new(1.0, 2.0, 5.0));
        assert_eq!(Vector3::xy(3.0, 4.0).distance_to(&Vector3::zero()), 5.0);
    }
}
