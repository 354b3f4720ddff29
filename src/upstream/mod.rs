// src/upstream/mod.rs
//! Implementations of [`PageSource`](crate::collect::types::PageSource).

pub mod fixture;
pub mod redfin;

pub use fixture::FixtureSource;
pub use redfin::{RedfinCfg, RedfinGisSource};
