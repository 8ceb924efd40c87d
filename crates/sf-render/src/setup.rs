//! Loudspeaker setups
//!
//! A reproduction setup is a list of loudspeakers with position,
//! orientation, model and tapering weight.  Parsing setup files is an
//! outer-layer concern; the engine consumes the plain data and offers
//! constructors for the common array shapes.

use serde::{Deserialize, Serialize};

use sf_core::{DirectionalPoint, Orientation, Position, Sample};

/// Loudspeaker model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoudspeakerModel {
    /// Regular full-range loudspeaker
    #[default]
    Normal,
    /// Subwoofer; driven with reference-corrected delay, ignored by
    /// loudspeaker selection
    Subwoofer,
}

/// Single loudspeaker definition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Loudspeaker {
    /// Position and orientation, relative to the reference
    pub point: DirectionalPoint,
    pub model: LoudspeakerModel,
    /// Tapering weight (1 = no tapering)
    pub weight: Sample,
}

impl Loudspeaker {
    pub fn new(position: Position, orientation: Orientation) -> Self {
        Self {
            point: DirectionalPoint::new(position, orientation),
            model: LoudspeakerModel::Normal,
            weight: 1.0,
        }
    }

    pub fn subwoofer(position: Position) -> Self {
        Self {
            point: DirectionalPoint::new(position, Orientation::new(0.0)),
            model: LoudspeakerModel::Subwoofer,
            weight: 1.0,
        }
    }
}

/// A reproduction setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoudspeakerSetup {
    pub speakers: Vec<Loudspeaker>,
}

impl LoudspeakerSetup {
    pub fn new(speakers: Vec<Loudspeaker>) -> Self {
        Self { speakers }
    }

    /// Circular array of `count` loudspeakers with the given radius,
    /// centered on the origin, all facing inward.  Loudspeaker 0 sits at
    /// azimuth 0, the rest follow counterclockwise.
    pub fn circular(count: usize, radius: Sample) -> Self {
        let speakers = (0..count)
            .map(|k| {
                let azimuth = 360.0 * k as Sample / count as Sample;
                let position = Position::new(radius, 0.0).rotate(azimuth);
                // facing the center
                let orientation = Orientation::new(azimuth + 180.0);
                Loudspeaker::new(position, orientation)
            })
            .collect();
        Self { speakers }
    }

    /// Linear array of `count` loudspeakers with the given spacing,
    /// parallel to the x axis at the given distance in front of the
    /// reference, facing the reference.
    pub fn linear(count: usize, spacing: Sample, distance: Sample) -> Self {
        let width = spacing * (count.saturating_sub(1)) as Sample;
        let speakers = (0..count)
            .map(|k| {
                let x = -width / 2.0 + spacing * k as Sample;
                Loudspeaker::new(Position::new(x, distance), Orientation::new(-90.0))
            })
            .collect();
        Self { speakers }
    }

    pub fn len(&self) -> usize {
        self.speakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.speakers.is_empty()
    }

    pub fn has_subwoofers(&self) -> bool {
        self.speakers
            .iter()
            .any(|s| s.model == LoudspeakerModel::Subwoofer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circular_setup_faces_center() {
        let setup = LoudspeakerSetup::circular(8, 1.5);
        assert_eq!(setup.len(), 8);

        for speaker in &setup.speakers {
            assert!((speaker.point.position.length() - 1.5).abs() < 1e-5);
            // orientation direction points back at the origin
            let inward = speaker.point.orientation.direction();
            let outward = speaker.point.position;
            let dot = inward.dot(&outward);
            assert!(dot < -1.4, "speaker not facing the center: {dot}");
        }
    }

    #[test]
    fn test_linear_setup_is_centered() {
        let setup = LoudspeakerSetup::linear(4, 0.5, 2.0);
        let sum_x: Sample = setup.speakers.iter().map(|s| s.point.position.x).sum();
        assert!(sum_x.abs() < 1e-5);
        for s in &setup.speakers {
            assert!((s.point.position.y - 2.0).abs() < 1e-6);
            assert!((s.point.orientation.azimuth - (-90.0)).abs() < 1e-4);
        }
    }
}
