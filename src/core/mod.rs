//! Configuration, policy, canonical ids and the error taxonomy.

pub mod canonical;
pub mod config;
pub mod errors;
pub mod policy;
