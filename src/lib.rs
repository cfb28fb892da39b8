//! Chat calls - call session controller and remote video pipeline for
//! peer-to-peer calls signaled over chat messages.

pub mod calling;
pub mod config;
