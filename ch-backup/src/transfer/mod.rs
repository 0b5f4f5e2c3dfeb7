//! Transfer bookkeeping.

pub mod progress;
