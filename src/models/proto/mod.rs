//! Wire & storage models, encoded with prost.

pub mod object;
pub mod transport;
