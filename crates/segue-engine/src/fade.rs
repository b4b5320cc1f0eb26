//! Gain envelopes driving stream fades.
//!
//! An envelope is a list of `(time, gain)` control points in stream
//! running time. The media graph interpolates linearly between points as
//! the stream clock advances; the engine only ever looks at the resulting
//! live gain to decide when a fade is over.

use std::time::Duration;

/// How close the live gain has to get to the fade target to count as done.
pub const EPSILON: f64 = 0.001;

/// Upper bound on replaygain scaling.
pub const MAX_REPLAYGAIN_SCALE: f64 = 15.0;

/// A single envelope control point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlPoint {
    pub time: Duration,
    pub gain: f64,
}

/// Time-ordered gain control points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    points: Vec<ControlPoint>,
}

impl Envelope {
    pub const fn new() -> Self {
        Self { points: Vec::new() }
    }

    /// Build a linear slide from `start` to `end` beginning at `at`.
    ///
    /// The start gain is also pinned at time zero so that evaluating the
    /// envelope before `at` holds the starting gain.
    pub fn slide(start: f64, end: f64, at: Duration, length: Duration) -> Self {
        let mut envelope = Self::new();
        envelope.set(Duration::ZERO, start);
        envelope.set(at, start);
        envelope.set(at + length, end);
        envelope
    }

    /// Set a control point, replacing any existing point at the same time.
    pub fn set(&mut self, time: Duration, gain: f64) {
        match self.points.binary_search_by(|p| p.time.cmp(&time)) {
            Ok(index) => self.points[index].gain = gain,
            Err(index) => self.points.insert(index, ControlPoint { time, gain }),
        }
    }

    pub fn points(&self) -> &[ControlPoint] {
        &self.points
    }

    /// Gain at the final control point.
    pub fn target(&self) -> Option<f64> {
        self.points.last().map(|p| p.gain)
    }

    /// Evaluate the envelope at a point in stream time.
    pub fn value_at(&self, time: Duration) -> Option<f64> {
        let first = self.points.first()?;
        if time <= first.time {
            return Some(first.gain);
        }

        let index = self.points.partition_point(|p| p.time <= time);
        let Some(next) = self.points.get(index) else {
            return self.target();
        };
        let prev = self.points[index - 1];

        let span = (next.time - prev.time).as_secs_f64();
        if span <= 0.0 {
            return Some(next.gain);
        }
        let t = (time - prev.time).as_secs_f64() / span;
        Some((next.gain - prev.gain).mul_add(t, prev.gain))
    }
}

/// Direction of a fade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeDirection {
    In,
    Out,
}

impl FadeDirection {
    /// Whether `gain` is close enough to `target` to end a fade in this direction.
    pub fn reached(self, gain: f64, target: f64) -> bool {
        match self {
            Self::In => gain > target - EPSILON,
            Self::Out => gain < target + EPSILON,
        }
    }
}

/// A fade waiting to be started once the stream has a usable position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadeSpec {
    pub start: f64,
    pub end: f64,
    pub length: Duration,
}

/// Length of a fade out that starts part-way through a fade in.
///
/// Scaling by the current gain keeps the slope of the outgoing fade the
/// same as a full-length fade from unity would have.
pub fn scaled_fade_length(length: Duration, current_gain: f64) -> Duration {
    length.mul_f64(current_gain.clamp(0.0, 1.0))
}

/// Compute the replaygain scale factor for a stream.
///
/// Album values win over track values; the scale is limited so the peak
/// doesn't clip and capped at [`MAX_REPLAYGAIN_SCALE`]. Returns `None`
/// when no gain is known.
pub fn replaygain_scale(
    track_gain: f64,
    track_peak: f64,
    album_gain: f64,
    album_peak: f64,
) -> Option<f64> {
    let gain = if album_gain == 0.0 {
        track_gain
    } else {
        album_gain
    };
    if gain == 0.0 {
        return None;
    }

    let mut scale = 10f64.powf(gain / 20.0);

    let peak = if album_peak == 0.0 {
        track_peak
    } else {
        album_peak
    };
    if peak != 0.0 && scale * peak > 1.0 {
        scale = 1.0 / peak;
    }

    Some(scale.min(MAX_REPLAYGAIN_SCALE))
}
