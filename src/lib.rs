// Position control of servos sharing one half-duplex bus, using sync write
// for goals and sync read for present positions.

pub mod cli;
pub mod config;
pub mod error;
pub mod messages;
pub mod runtime;
pub mod sequencer;
pub mod servo;

pub use error::{Error, Result};
