//! Portable attention kernels.
//!
//! [`ExactAttention`] scores every query against every key and is the
//! numerical baseline. [`ProbSparseAttention`] scores only the most
//! informative queries and falls back to a cheap default for the rest.

pub mod exact;
pub mod prob_sparse;

pub use exact::ExactAttention;
pub use prob_sparse::ProbSparseAttention;
