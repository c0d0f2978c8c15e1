//! Application module: command line, configuration and the simulated session

pub mod cli;
pub mod report;
pub mod simulate;
pub mod startup;
