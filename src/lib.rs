//! Greylop, a coverage-guided grey-box fuzzer for AFL-instrumented targets.
//!
//! The target records edge hits into a shared-memory bitmap and hosts an
//! AFL-style fork server on file descriptors 198/199. Greylop drives it in a
//! loop: pick a seed from the queue, mutate it, run the target once through
//! the fork server, and keep every input that covers a new edge or crashes.

pub mod config;
pub mod corpus;
pub mod coverage;
pub mod executor;
pub mod fuzzer;
pub mod mutation;
pub mod scheduler;
