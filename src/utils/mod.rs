//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod align;
mod error;

pub use align::{
    align_down, align_up, gcd, lcm, replication_read_size, rs_read_size,
};
pub use error::DriftError;
