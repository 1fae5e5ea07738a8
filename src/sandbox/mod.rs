//! Sandbox preparation and launch
//!
//! Build resolution, network gate, dependency isolation and the launcher that
//! starts the runner under resource limits in its own process group.

pub mod build;
pub mod child;
pub mod deps;
pub mod launcher;
pub mod network;
