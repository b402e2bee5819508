//! Command implementations
//!
//! `build` and `deploy` share the wiring in [`agent`]; `check-image` only
//! needs the settings.

pub mod agent;
pub mod check_image;
