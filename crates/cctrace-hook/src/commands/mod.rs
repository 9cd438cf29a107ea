//! CLI command implementations

pub mod doctor;
pub mod hook;
pub mod reset;
pub mod status;
