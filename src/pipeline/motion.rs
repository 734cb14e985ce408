//! Motion scoring and the event state machine.

use image::{GenericImageView, GrayImage, Rgb};
use serde::Serialize;

use crate::capture::transform::{abs_diff, count_nonzero, downscale, threshold, to_gray};
use crate::DetectionConfig;

/// Scores frames by how many downscaled pixels changed since the last one
#[derive(Debug)]
pub struct MotionDetector {
    scale_factor: u32,
    diff_threshold: u8,
    previous: Option<GrayImage>,
}

impl MotionDetector {
    pub fn new(scale_factor: u32, diff_threshold: u8) -> Self {
        Self {
            scale_factor: scale_factor.max(1),
            diff_threshold,
            previous: None,
        }
    }

    pub fn from_config(config: &DetectionConfig) -> Self {
        Self::new(config.scale_factor, config.diff_threshold)
    }

    /// Motion score of `image` against the previous call's image.
    ///
    /// The reference starts out black and goes black again whenever the
    /// frame size changes.
    pub fn score<I>(&mut self, image: &I) -> u32
    where
        I: GenericImageView<Pixel = Rgb<u8>>,
    {
        let gray = to_gray(&downscale(image, self.scale_factor));

        let previous = match self.previous.take() {
            Some(prev) if prev.dimensions() == gray.dimensions() => prev,
            _ => GrayImage::new(gray.width(), gray.height()),
        };

        let mut diff = abs_diff(&gray, &previous);
        threshold(&mut diff, self.diff_threshold);
        self.previous = Some(gray);

        count_nonzero(&diff)
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum MotionState {
    #[default]
    Idle,
    Recording,
}

/// What a single score did to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Idle and quiet, the frame can be recycled
    Quiet,
    /// An event opened on this frame
    Started { action_id: u32 },
    /// Inside an event
    Continued { action_id: u32 },
    /// This frame closes the event
    Ended { action_id: u32 },
}

impl Transition {
    /// Frames that belong to an event
    pub fn action_id(self) -> Option<u32> {
        match self {
            Transition::Quiet => None,
            Transition::Started { action_id }
            | Transition::Continued { action_id }
            | Transition::Ended { action_id } => Some(action_id),
        }
    }
}

/// Decides where events begin and end
#[derive(Debug)]
pub struct MotionTracker {
    movement_thresh: u32,
    max_no_movement_frames: u32,
    state: MotionState,
    no_movement_frames: u32,
    action_id: u32,
}

impl MotionTracker {
    pub fn new(movement_thresh: u32, max_no_movement_frames: u32) -> Self {
        Self {
            movement_thresh,
            max_no_movement_frames,
            state: MotionState::Idle,
            no_movement_frames: 0,
            action_id: 0,
        }
    }

    pub fn from_config(config: &DetectionConfig) -> Self {
        Self::new(config.movement_thresh, config.max_no_movement_frames)
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    /// Id of the open event, or of the last one once idle
    pub fn action_id(&self) -> u32 {
        self.action_id
    }

    pub fn update(&mut self, score: u32) -> Transition {
        let moving = score >= self.movement_thresh;

        match self.state {
            MotionState::Idle if moving => {
                self.state = MotionState::Recording;
                self.no_movement_frames = 0;
                self.action_id += 1;
                Transition::Started {
                    action_id: self.action_id,
                }
            }
            MotionState::Idle => Transition::Quiet,
            MotionState::Recording => {
                if moving {
                    self.no_movement_frames = 0;
                } else {
                    self.no_movement_frames += 1;
                }

                if self.no_movement_frames >= self.max_no_movement_frames {
                    self.state = MotionState::Idle;
                    self.no_movement_frames = 0;
                    Transition::Ended {
                        action_id: self.action_id,
                    }
                } else {
                    Transition::Continued {
                        action_id: self.action_id,
                    }
                }
            }
        }
    }

    /// End an open event without a closing frame, e.g. on shutdown
    pub fn force_close(&mut self) -> Option<u32> {
        if self.state == MotionState::Recording {
            self.state = MotionState::Idle;
            self.no_movement_frames = 0;
            Some(self.action_id)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, RgbImage};

    #[test]
    fn event_boundaries_follow_scores() {
        let scores = [0, 0, 0, 900, 900, 900, 0, 0, 0, 0, 0, 0, 0];
        let mut tracker = MotionTracker::new(800, 5);

        let transitions: Vec<_> = scores.iter().map(|&s| tracker.update(s)).collect();

        for t in &transitions[..3] {
            assert_eq!(*t, Transition::Quiet);
        }
        assert_eq!(transitions[3], Transition::Started { action_id: 1 });
        for t in &transitions[4..10] {
            assert_eq!(*t, Transition::Continued { action_id: 1 });
        }
        assert_eq!(transitions[10], Transition::Ended { action_id: 1 });
        for t in &transitions[11..] {
            assert_eq!(*t, Transition::Quiet);
        }
        assert_eq!(tracker.state(), MotionState::Idle);
    }

    #[test]
    fn motion_inside_an_event_resets_the_countdown() {
        let mut tracker = MotionTracker::new(10, 3);
        assert!(matches!(tracker.update(10), Transition::Started { .. }));
        tracker.update(0);
        tracker.update(0);
        assert!(matches!(tracker.update(50), Transition::Continued { .. }));
        tracker.update(0);
        tracker.update(0);
        assert_eq!(tracker.update(0), Transition::Ended { action_id: 1 });

        assert_eq!(tracker.update(99), Transition::Started { action_id: 2 });
        assert_eq!(tracker.force_close(), Some(2));
        assert_eq!(tracker.force_close(), None);
    }

    #[test]
    fn first_frame_is_compared_against_black() {
        let mut detector = MotionDetector::new(2, 45);
        let dark: RgbImage = ImageBuffer::from_pixel(8, 8, Rgb([30, 30, 30]));
        let bright: RgbImage = ImageBuffer::from_pixel(8, 8, Rgb([200, 200, 200]));

        assert_eq!(detector.score(&dark), 0);
        assert_eq!(detector.score(&dark), 0);
        assert_eq!(detector.score(&bright), 16);
        assert_eq!(detector.score(&bright), 0);

        // New size resets the reference to black
        let bright_small: RgbImage = ImageBuffer::from_pixel(4, 4, Rgb([200, 200, 200]));
        assert_eq!(detector.score(&bright_small), 4);
    }

    #[test]
    fn partial_change_scores_changed_pixels() {
        let mut detector = MotionDetector::new(1, 45);
        let base: RgbImage = ImageBuffer::from_pixel(10, 10, Rgb([20, 20, 20]));
        detector.score(&base);

        let mut moved = base.clone();
        for x in 0..5 {
            moved.put_pixel(x, 0, Rgb([255, 255, 255]));
        }
        assert_eq!(detector.score(&moved), 5);
    }
}
