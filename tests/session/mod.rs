//! Session Integration Test Modules

pub mod binary;
pub mod public_api;
pub mod simulation;
