//! Job scheduler glue.
//!
//! Appends recurring ETL jobs to their stream and turns due notification rows
//! into delivery messages.

pub mod producer;
pub mod scheduler;

#[cfg(test)]
mod testing;
