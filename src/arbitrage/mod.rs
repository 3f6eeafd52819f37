//! Position lifecycle and process-wide execution gating.

pub mod controller;
pub mod gate;
