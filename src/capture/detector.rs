//! Occupancy detection seam

use crate::accumulator::{BackgroundModel, LumaFrame};
use crate::config::DetectionConfig;

/// Decides whether a frame shows activity against the background model.
///
/// Implementations own their thresholds; the capture loop only consumes the
/// boolean.
pub trait OccupancyDetector: Send + 'static {
    fn is_occupied(&self, frame: &LumaFrame, background: &BackgroundModel) -> bool;
}

impl<F> OccupancyDetector for F
where
    F: Fn(&LumaFrame, &BackgroundModel) -> bool + Send + 'static,
{
    fn is_occupied(&self, frame: &LumaFrame, background: &BackgroundModel) -> bool {
        self(frame, background)
    }
}

/// Counts pixels that differ from the background by more than a threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelDeltaDetector {
    delta_threshold: f32,
    min_area: usize,
}

impl PixelDeltaDetector {
    pub fn new(delta_threshold: f32, min_area: usize) -> Self {
        Self { delta_threshold, min_area }
    }

    /// Pixels whose luma is more than the threshold away from the background.
    pub fn changed_pixels(&self, frame: &LumaFrame, background: &BackgroundModel) -> usize {
        let average = background.average();
        if !average.same_shape(frame) {
            return 0;
        }
        frame
            .values
            .iter()
            .zip(&average.values)
            .filter(|&(&value, &bg)| (value - bg.round()).abs() > self.delta_threshold)
            .count()
    }
}

impl From<&DetectionConfig> for PixelDeltaDetector {
    fn from(config: &DetectionConfig) -> Self {
        Self::new(config.delta_threshold, config.min_area)
    }
}

impl OccupancyDetector for PixelDeltaDetector {
    fn is_occupied(&self, frame: &LumaFrame, background: &BackgroundModel) -> bool {
        self.changed_pixels(frame, background) > self.min_area
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Frame;
    use crate::accumulator::preprocess;

    fn luma(value: u8) -> LumaFrame {
        preprocess(&Frame::filled(10, 10, 1, value))
    }

    #[test]
    fn counts_pixels_beyond_threshold() {
        let detector = PixelDeltaDetector::new(5.0, 50);
        let background = BackgroundModel::new(luma(100));

        assert_eq!(detector.changed_pixels(&luma(104), &background), 0);
        assert_eq!(detector.changed_pixels(&luma(120), &background), 100);
        assert!(detector.is_occupied(&luma(120), &background));
        assert!(!detector.is_occupied(&luma(100), &background));
    }

    #[test]
    fn area_must_be_exceeded() {
        let background = BackgroundModel::new(luma(0));
        let mut values = vec![0.0f32; 100];
        values[..50].iter_mut().for_each(|v| *v = 255.0);
        let half = LumaFrame { width: 10, height: 10, values };

        assert!(!PixelDeltaDetector::new(5.0, 50).is_occupied(&half, &background));
        assert!(PixelDeltaDetector::new(5.0, 49).is_occupied(&half, &background));
    }

    #[test]
    fn mismatched_shape_is_never_occupied() {
        let detector = PixelDeltaDetector::new(0.0, 0);
        let background = BackgroundModel::new(luma(0));
        let other = preprocess(&Frame::filled(4, 4, 1, 255));
        assert!(!detector.is_occupied(&other, &background));
    }

    #[test]
    fn closures_are_detectors() {
        let always = |_: &LumaFrame, _: &BackgroundModel| true;
        assert!(always.is_occupied(&luma(1), &BackgroundModel::new(luma(1))));
    }
}
