//! Rivulet Testing Utilities.

/// In-memory byte channel standing in for the network transport.
pub mod simplechannel;
