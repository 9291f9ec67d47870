//! Window assigners
//!
//! Strategies for mapping an event timestamp to the window(s) it belongs to.
//! Bounds are aligned to the epoch, so every key shares the same grid.

use std::fmt;
use std::time::Duration;
use telemetry_config::{WindowConfig, WindowKind};

use super::types::WindowBounds;
use crate::error::{WindowError, WindowResult};

/// Trait for assigning events to windows
pub trait WindowAssigner: Send + Sync + fmt::Debug {
    /// Assign a timestamp (epoch ms) to one or more windows, ascending by start
    fn assign_windows(&self, timestamp: i64) -> WindowResult<Vec<WindowBounds>>;

    /// Window length in milliseconds
    fn size_ms(&self) -> i64;

    /// Get the maximum number of windows an event can be assigned to
    fn max_windows_per_event(&self) -> usize {
        1
    }
}

/// Tumbling window assigner
///
/// Creates fixed-size, non-overlapping windows. Each event is assigned to
/// exactly one window: `start = floor(t / size) * size`.
///
/// # Example
/// ```text
/// Window size: 5 seconds
/// Event at timestamp 7 -> Window [5, 10)
/// Event at timestamp 12 -> Window [10, 15)
/// ```
#[derive(Debug, Clone)]
pub struct TumblingWindowAssigner {
    size_ms: i64,
}

impl TumblingWindowAssigner {
    pub fn new(size: Duration) -> WindowResult<Self> {
        let size_ms = size.as_millis() as i64;
        if size_ms <= 0 {
            return Err(WindowError::InvalidWindowSize { size: size_ms });
        }
        Ok(Self { size_ms })
    }
}

impl WindowAssigner for TumblingWindowAssigner {
    fn assign_windows(&self, timestamp: i64) -> WindowResult<Vec<WindowBounds>> {
        let start = timestamp.div_euclid(self.size_ms) * self.size_ms;
        let end = start
            .checked_add(self.size_ms)
            .ok_or_else(|| WindowError::InvalidTimestamp {
                timestamp,
                reason: "window end overflows".to_string(),
            })?;
        Ok(vec![WindowBounds::from_millis(start, end)?])
    }

    fn size_ms(&self) -> i64 {
        self.size_ms
    }
}

/// Sliding window assigner
///
/// Creates fixed-size windows whose starts are `slide` apart. Each event is
/// assigned to every window that covers it, `ceil(size / slide)` at most.
///
/// # Example
/// ```text
/// Window size: 10 seconds, Slide: 5 seconds
/// Event at timestamp 7 -> Windows [0, 10), [5, 15)
/// Event at timestamp 12 -> Windows [5, 15), [10, 20)
/// ```
#[derive(Debug, Clone)]
pub struct SlidingWindowAssigner {
    size_ms: i64,
    slide_ms: i64,
}

impl SlidingWindowAssigner {
    pub fn new(size: Duration, slide: Duration) -> WindowResult<Self> {
        let size_ms = size.as_millis() as i64;
        let slide_ms = slide.as_millis() as i64;
        if size_ms <= 0 {
            return Err(WindowError::InvalidWindowSize { size: size_ms });
        }
        if slide_ms <= 0 || slide_ms > size_ms {
            return Err(WindowError::InvalidSlideSize {
                slide: slide_ms,
                window: size_ms,
            });
        }
        Ok(Self { size_ms, slide_ms })
    }
}

impl WindowAssigner for SlidingWindowAssigner {
    fn assign_windows(&self, timestamp: i64) -> WindowResult<Vec<WindowBounds>> {
        let last_start = timestamp.div_euclid(self.slide_ms) * self.slide_ms;
        let mut windows = Vec::with_capacity(self.max_windows_per_event());

        let mut start = last_start;
        while start > timestamp.saturating_sub(self.size_ms) {
            let end = start
                .checked_add(self.size_ms)
                .ok_or_else(|| WindowError::InvalidTimestamp {
                    timestamp,
                    reason: "window end overflows".to_string(),
                })?;
            windows.push(WindowBounds::from_millis(start, end)?);
            start -= self.slide_ms;
        }

        windows.reverse();
        Ok(windows)
    }

    fn size_ms(&self) -> i64 {
        self.size_ms
    }

    fn max_windows_per_event(&self) -> usize {
        ((self.size_ms + self.slide_ms - 1) / self.slide_ms) as usize
    }
}

/// Build the assigner described by a window configuration
pub fn from_config(config: &WindowConfig) -> WindowResult<Box<dyn WindowAssigner>> {
    match (config.kind, config.slide) {
        (WindowKind::Tumbling, _) => Ok(Box::new(TumblingWindowAssigner::new(config.size)?)),
        (WindowKind::Sliding, Some(slide)) => {
            Ok(Box::new(SlidingWindowAssigner::new(config.size, slide)?))
        }
        (WindowKind::Sliding, None) => Err(WindowError::InvalidSlideSize {
            slide: 0,
            window: config.size_ms(),
        }),
    }
}
