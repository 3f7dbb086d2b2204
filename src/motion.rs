//! Inertial motion samples.
//!
//! Motion arrives on its own cadence, independent of camera frames. The
//! recorder never waits for it: when a frame is recorded it copies whatever
//! sample is latest at that moment.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// One device-motion reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    /// Seconds, same clock as frame timestamps.
    pub timestamp: f64,
    /// rad/s around x, y, z.
    pub rotation_rate: [f64; 3],
    /// Acceleration without gravity, in g.
    pub user_acceleration: [f64; 3],
    /// Calibrated magnetic field, microtesla.
    pub magnetic_field: [f64; 3],
    /// Roll, pitch, yaw in radians.
    pub attitude: [f64; 3],
    /// Gravity vector, in g.
    pub gravity: [f64; 3],
}

impl MotionSample {
    /// Number of values in [`MotionSample::to_vector`].
    pub const VECTOR_LEN: usize = 15;

    /// Flattened as rotation rate, user acceleration, magnetic field,
    /// attitude, gravity.
    pub fn to_vector(&self) -> [f64; Self::VECTOR_LEN] {
        let mut out = [0.0; Self::VECTOR_LEN];
        let groups = [
            self.rotation_rate,
            self.user_acceleration,
            self.magnetic_field,
            self.attitude,
            self.gravity,
        ];
        for (i, group) in groups.iter().enumerate() {
            out[i * 3..i * 3 + 3].copy_from_slice(group);
        }
        out
    }

    pub fn from_vector(timestamp: f64, v: &[f64; Self::VECTOR_LEN]) -> Self {
        let group = |i: usize| [v[i * 3], v[i * 3 + 1], v[i * 3 + 2]];
        Self {
            timestamp,
            rotation_rate: group(0),
            user_acceleration: group(1),
            magnetic_field: group(2),
            attitude: group(3),
            gravity: group(4),
        }
    }
}

/// Source of motion samples the recorder starts and stops with each session.
pub trait MotionSource: Send + Sync {
    fn start_updates(&self);
    fn stop_updates(&self);
    /// Latest sample, copied out. `None` before the first update.
    fn latest(&self) -> Option<MotionSample>;
}

/// Latest-value motion feed backed by a `watch` channel.
///
/// The producer side ([`MotionPublisher`]) only forwards samples while the
/// feed is active, mirroring a sensor that is switched on for a recording.
#[derive(Clone)]
pub struct MotionFeed {
    rx: watch::Receiver<Option<MotionSample>>,
    active: Arc<AtomicBool>,
}

/// Producer half of a [`MotionFeed`].
#[derive(Clone)]
pub struct MotionPublisher {
    tx: Arc<watch::Sender<Option<MotionSample>>>,
    active: Arc<AtomicBool>,
}

impl MotionFeed {
    pub fn new() -> (Self, MotionPublisher) {
        let (tx, rx) = watch::channel(None);
        let active = Arc::new(AtomicBool::new(false));
        (
            Self {
                rx,
                active: active.clone(),
            },
            MotionPublisher {
                tx: Arc::new(tx),
                active,
            },
        )
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl MotionSource for MotionFeed {
    fn start_updates(&self) {
        self.active.store(true, Ordering::Release);
        tracing::debug!("Motion updates started");
    }

    fn stop_updates(&self) {
        self.active.store(false, Ordering::Release);
        tracing::debug!("Motion updates stopped");
    }

    fn latest(&self) -> Option<MotionSample> {
        *self.rx.borrow()
    }
}

impl MotionPublisher {
    /// Publish a sample. Dropped while updates are stopped.
    pub fn publish(&self, sample: MotionSample) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send_replace(Some(sample));
        true
    }
}

/// Motion source for devices without an IMU.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMotion;

impl MotionSource for NoMotion {
    fn start_updates(&self) {}
    fn stop_updates(&self) {}
    fn latest(&self) -> Option<MotionSample> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_order() {
        let sample = MotionSample {
            timestamp: 1.0,
            rotation_rate: [1.0, 2.0, 3.0],
            user_acceleration: [4.0, 5.0, 6.0],
            magnetic_field: [7.0, 8.0, 9.0],
            attitude: [10.0, 11.0, 12.0],
            gravity: [13.0, 14.0, 15.0],
        };
        let v = sample.to_vector();
        assert_eq!(v[0], 1.0);
        assert_eq!(v[9], 10.0);
        assert_eq!(v[14], 15.0);
        assert_eq!(MotionSample::from_vector(1.0, &v), sample);
    }

    #[test]
    fn test_feed_only_forwards_while_active() {
        let (feed, publisher) = MotionFeed::new();
        let sample = MotionSample {
            timestamp: 0.5,
            ..Default::default()
        };

        assert!(!publisher.publish(sample));
        assert_eq!(feed.latest(), None);

        feed.start_updates();
        assert!(publisher.publish(sample));
        assert_eq!(feed.latest().map(|s| s.timestamp), Some(0.5));

        feed.stop_updates();
        assert!(!publisher.publish(MotionSample::default()));
        assert_eq!(feed.latest().map(|s| s.timestamp), Some(0.5));
    }
}
