//! Weighted sampling without replacement.

pub mod a_res;

pub use a_res::AResSampler;
