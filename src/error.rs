//! Error types.

use thiserror::Error;

use crate::node::NodeId;

/// Which side of a node a bus belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Direction {
    Input,
    Output,
}

impl core::fmt::Display for Direction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Errors reported by [`Graph`](crate::Graph) operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The requested or first free bus is out of capacity or already carries a connection.
    ///
    /// `bus` is `None` when no free bus could be found at all.
    #[error("{direction} bus {} is not available", bus.map_or_else(|| "(any)".to_string(), |b| b.to_string()))]
    BusUnavailable {
        direction: Direction,
        bus: Option<u32>,
    },

    #[error("node {0:?} is already attached")]
    NodeAlreadyAttached(NodeId),

    #[error("node {0:?} is not attached")]
    NodeNotAttached(NodeId),

    #[error("graph is already running")]
    AlreadyRunning,
}

/// Errors reported by [`PcmBuffer`](crate::PcmBuffer).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BufferError {
    #[error("buffer formats do not match")]
    FormatMismatch,

    #[error("frame length {requested} exceeds capacity {capacity}")]
    FrameLengthOutOfRange { requested: u32, capacity: u32 },
}

/// Errors reported by I/O driver cores.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("audio stream error: {0}")]
    Stream(String),

    #[error("unsupported sample format: {0}")]
    UnsupportedSampleFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_unavailable_display() {
        let err = GraphError::BusUnavailable {
            direction: Direction::Output,
            bus: Some(3),
        };
        assert_eq!(err.to_string(), "output bus 3 is not available");

        let err = GraphError::BusUnavailable {
            direction: Direction::Input,
            bus: None,
        };
        assert_eq!(err.to_string(), "input bus (any) is not available");
    }

    #[test]
    fn already_running_display() {
        assert_eq!(GraphError::AlreadyRunning.to_string(), "graph is already running");
    }

    #[test]
    fn buffer_error_display() {
        let err = BufferError::FrameLengthOutOfRange {
            requested: 10,
            capacity: 4,
        };
        assert_eq!(err.to_string(), "frame length 10 exceeds capacity 4");
    }
}
