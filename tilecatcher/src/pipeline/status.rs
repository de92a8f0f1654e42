//! Backpressure meter.
//!
//! Each bounded queue maps its fill ratio to a three-color status; the
//! system status is the worse of the two. The triple rides on every
//! response and health probe so the microscope can throttle before the
//! queues overflow and tiles are lost.

/// Health of one bounded queue (or of the system as a whole).
///
/// Wire encoding: 0 = GREEN, 1 = YELLOW, 2 = RED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(i16)]
pub enum QueueStatus {
    /// System is fully functional
    #[default]
    Green = 0,
    /// System is becoming busy
    Yellow = 1,
    /// System is very close to choking, if not already
    Red = 2,
}

impl QueueStatus {
    /// Derives the status from a queue's instantaneous depth and capacity.
    ///
    /// A capacity of zero means the stage has no bounded queue (inline
    /// execution) and always reads GREEN.
    pub fn from_depth(depth: usize, capacity: usize) -> Self {
        if capacity == 0 {
            return QueueStatus::Green;
        }
        let ratio = depth as f64 / capacity as f64;
        if ratio < 0.7 {
            QueueStatus::Green
        } else if ratio < 0.9 {
            QueueStatus::Yellow
        } else {
            QueueStatus::Red
        }
    }

    /// Status name as carried in HTTP headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Green => "GREEN",
            QueueStatus::Yellow => "YELLOW",
            QueueStatus::Red => "RED",
        }
    }

    /// Wire encoding for the socket response.
    #[inline]
    pub fn as_wire(&self) -> i16 {
        *self as i16
    }

    /// Decodes the wire encoding; unknown values read RED so a confused
    /// sender errs on the side of throttling.
    pub fn from_wire(value: i16) -> Self {
        match value {
            0 => QueueStatus::Green,
            1 => QueueStatus::Yellow,
            _ => QueueStatus::Red,
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The `(system, tile queue, content queue)` backpressure triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusTriple {
    pub system: QueueStatus,
    pub tile_queue: QueueStatus,
    pub content_queue: QueueStatus,
}

impl StatusTriple {
    /// Combines per-queue statuses; the system reads as the worse one.
    pub fn new(tile_queue: QueueStatus, content_queue: QueueStatus) -> Self {
        Self {
            system: tile_queue.max(content_queue),
            tile_queue,
            content_queue,
        }
    }

    /// Forces the system status to RED, as done on explicit error paths to
    /// push the sender toward immediate throttling.
    pub fn degraded(mut self) -> Self {
        self.system = QueueStatus::Red;
        self
    }
}
