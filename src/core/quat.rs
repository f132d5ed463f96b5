//! Rotation Quaternion
//!
//! Orientation of a synchronized entity. Interpolation always takes the
//! shortest arc so remote avatars never spin the long way around.

use std::fmt;
use serde::{Serialize, Deserialize};

/// Dot product above which slerp falls back to normalized lerp.
const SLERP_LINEAR_THRESHOLD: f32 = 0.9995;

/// Unit quaternion (x, y, z, w).
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
    /// Z component
    pub z: f32,
    /// Scalar component
    pub w: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quat {
    /// No rotation.
    pub const IDENTITY: Self = Self { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    /// Create from raw components (not normalized).
    #[inline]
    pub const fn from_xyzw(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    /// Rotation of `yaw` radians about the vertical (+Y) axis.
    pub fn from_yaw(yaw: f32) -> Self {
        let half = yaw * 0.5;
        Self::from_xyzw(0.0, half.sin(), 0.0, half.cos())
    }

    /// Heading about +Y in radians, in (-PI, PI].
    pub fn yaw(self) -> f32 {
        let siny_cosp = 2.0 * (self.w * self.y + self.x * self.z);
        let cosy_cosp = 1.0 - 2.0 * (self.y * self.y + self.x * self.x);
        siny_cosp.atan2(cosy_cosp)
    }

    /// Four-component dot product.
    #[inline]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z + self.w * other.w
    }

    /// Length of the quaternion.
    #[inline]
    pub fn length(self) -> f32 {
        self.dot(self).sqrt()
    }

    /// Normalize to unit length. Returns IDENTITY for a degenerate input.
    pub fn normalize(self) -> Self {
        let len = self.length();
        if len <= f32::EPSILON || !len.is_finite() {
            return Self::IDENTITY;
        }
        let inv = 1.0 / len;
        Self::from_xyzw(self.x * inv, self.y * inv, self.z * inv, self.w * inv)
    }

    #[inline]
    fn negate(self) -> Self {
        Self::from_xyzw(-self.x, -self.y, -self.z, -self.w)
    }

    /// Angle in radians between two orientations (always the short way).
    pub fn angle_between(self, other: Self) -> f32 {
        let d = self.normalize().dot(other.normalize()).abs().min(1.0);
        2.0 * d.acos()
    }

    /// Shortest-path spherical interpolation.
    /// t = 0 returns self, t = 1 returns `end` (or its equivalent negation).
    pub fn slerp(self, end: Self, t: f32) -> Self {
        let start = self.normalize();
        let mut end = end.normalize();
        let mut cos_theta = start.dot(end);

        // q and -q encode the same rotation; pick the hemisphere of `start`.
        if cos_theta < 0.0 {
            end = end.negate();
            cos_theta = -cos_theta;
        }

        if cos_theta > SLERP_LINEAR_THRESHOLD {
            return Self::from_xyzw(
                start.x + (end.x - start.x) * t,
                start.y + (end.y - start.y) * t,
                start.z + (end.z - start.z) * t,
                start.w + (end.w - start.w) * t,
            )
            .normalize();
        }

        let theta = cos_theta.acos();
        let sin_theta = theta.sin();
        let a = ((1.0 - t) * theta).sin() / sin_theta;
        let b = (t * theta).sin() / sin_theta;

        Self::from_xyzw(
            start.x * a + end.x * b,
            start.y * a + end.y * b,
            start.z * a + end.z * b,
            start.w * a + end.w * b,
        )
    }
}

impl fmt::Debug for Quat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Quat({:.4}, {:.4}, {:.4}, {:.4})", self.x, self.y, self.z, self.w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_yaw_roundtrip() {
        for yaw in [-3.0f32, -1.0, 0.0, 0.5, 2.5] {
            assert!(approx(Quat::from_yaw(yaw).yaw(), yaw), "yaw {}", yaw);
        }
    }

    #[test]
    fn test_slerp_midpoint() {
        let a = Quat::from_yaw(0.0);
        let b = Quat::from_yaw(PI / 2.0);
        let mid = a.slerp(b, 0.5);
        assert!(approx(mid.yaw(), PI / 4.0));
        assert!(approx(mid.length(), 1.0));
    }

    #[test]
    fn test_slerp_takes_shortest_arc() {
        // 170deg -> -170deg is a 20deg turn through 180, not 340deg through 0.
        let a = Quat::from_yaw(170f32.to_radians());
        let b = Quat::from_yaw(-170f32.to_radians());
        let mid = a.slerp(b, 0.5);
        assert!(approx(mid.yaw().abs(), PI), "got {}", mid.yaw());
        assert!(mid.angle_between(a) < 11f32.to_radians());
    }

    #[test]
    fn test_slerp_handles_negated_end() {
        let a = Quat::from_yaw(0.3);
        let b = Quat::from_yaw(0.3);
        let neg_b = Quat::from_xyzw(-b.x, -b.y, -b.z, -b.w);
        let out = a.slerp(neg_b, 0.5);
        assert!(out.angle_between(a) < 1e-3);
    }

    #[test]
    fn test_normalize_degenerate() {
        assert_eq!(Quat::from_xyzw(0.0, 0.0, 0.0, 0.0).normalize(), Quat::IDENTITY);
    }
}
