//! Core types shared by every layer: constants, errors and peer identity.

mod constants;
mod error;
mod peer;

pub use constants::*;
pub use error::*;
pub use peer::*;
