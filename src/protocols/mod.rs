//! Wire protocols spoken over the board's serial links.

pub mod bm64;
