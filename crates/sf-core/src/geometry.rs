//! 2D scene geometry
//!
//! The scene is two-dimensional: positions are (x, y) in meters, orientations
//! are azimuth angles in degrees.  An azimuth of 0 looks along the positive
//! x axis, 90 degrees along positive y (counterclockwise).

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Div, Neg, Sub, SubAssign};

use crate::math::{deg_to_rad, wrap_angle};
use crate::Sample;

/// Position of a point in the scene (in meters).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: Sample,
    pub y: Sample,
}

impl Position {
    pub fn new(x: Sample, y: Sample) -> Self {
        Self { x, y }
    }

    /// Length of the position vector.
    pub fn length(&self) -> Sample {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Azimuth of the position vector.
    pub fn orientation(&self) -> Orientation {
        Orientation::new(self.y.atan2(self.x).to_degrees())
    }

    /// Inner product with another position vector.
    pub fn dot(&self, other: &Position) -> Sample {
        self.x * other.x + self.y * other.y
    }

    /// Turn around the origin by `angle` degrees (counterclockwise).
    pub fn rotate(self, angle: Sample) -> Self {
        let phi = deg_to_rad(angle);
        let (sin, cos) = phi.sin_cos();
        Self::new(self.x * cos - self.y * sin, self.x * sin + self.y * cos)
    }

    /// Distance to another point.
    pub fn distance(&self, other: &Position) -> Sample {
        (*self - *other).length()
    }
}

impl Add for Position {
    type Output = Position;
    fn add(self, rhs: Position) -> Position {
        Position::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Position {
    type Output = Position;
    fn sub(self, rhs: Position) -> Position {
        Position::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl AddAssign for Position {
    fn add_assign(&mut self, rhs: Position) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl SubAssign for Position {
    fn sub_assign(&mut self, rhs: Position) {
        self.x -= rhs.x;
        self.y -= rhs.y;
    }
}

impl Neg for Position {
    type Output = Position;
    fn neg(self) -> Position {
        Position::new(-self.x, -self.y)
    }
}

impl Div<Sample> for Position {
    type Output = Position;
    fn div(self, rhs: Sample) -> Position {
        Position::new(self.x / rhs, self.y / rhs)
    }
}

/// Orientation in the scene; only the azimuth (in degrees) is handled.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Orientation {
    /// Azimuth in degrees
    pub azimuth: Sample,
}

impl Orientation {
    pub fn new(azimuth: Sample) -> Self {
        Self { azimuth }
    }

    /// Unit vector pointing into the direction of this orientation.
    pub fn direction(&self) -> Position {
        let phi = deg_to_rad(self.azimuth);
        Position::new(phi.cos(), phi.sin())
    }

    /// Turn by `angle` degrees.
    pub fn rotate(self, angle: Sample) -> Self {
        Self::new(self.azimuth + angle)
    }
}

impl Add for Orientation {
    type Output = Orientation;
    fn add(self, rhs: Orientation) -> Orientation {
        // Angle renderers need wrapping
        Orientation::new(wrap_angle(self.azimuth + rhs.azimuth))
    }
}

impl Sub for Orientation {
    type Output = Orientation;
    fn sub(self, rhs: Orientation) -> Orientation {
        Orientation::new(wrap_angle(self.azimuth - rhs.azimuth))
    }
}

/// Angle (in radians) between the position vector of `point` and
/// `orientation`.
pub fn angle(point: Position, orientation: Orientation) -> Sample {
    deg_to_rad(point.orientation().azimuth - orientation.azimuth)
}

/// Combination of a position and an orientation.
///
/// Anything which has a position and an orientation (sources, loudspeakers,
/// the reference) can be expressed as one of these.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DirectionalPoint {
    pub position: Position,
    pub orientation: Orientation,
}

impl DirectionalPoint {
    pub fn new(position: Position, orientation: Orientation) -> Self {
        Self {
            position,
            orientation,
        }
    }

    /// Rotate around the origin.
    pub fn rotate(self, angle: Sample) -> Self {
        Self::new(self.position.rotate(angle), self.orientation.rotate(angle))
    }

    /// Express this point (given relative to `t`) in the frame `t` lives in:
    /// rotate by `t`'s orientation, then translate by `t`'s position.
    pub fn transform(self, t: &DirectionalPoint) -> Self {
        let rotated = self.rotate(t.orientation.azimuth);
        Self::new(rotated.position + t.position, rotated.orientation)
    }

    /// Signed distance between the plane described by `self` (the orientation
    /// is the plane normal) and `point`.
    pub fn plane_to_point_distance(&self, point: Position) -> Sample {
        (point - self.position).dot(&self.orientation.direction())
    }
}
