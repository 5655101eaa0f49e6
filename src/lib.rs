//! Chunked batch pipeline for generating rug scene images with the Gemini
//! Batch API.
//!
//! - [`models`]: catalog items and CSV/JSON loading
//! - [`gemini`]: remote batch job client
//! - [`pipeline`]: chunking, bounded-concurrency scheduling and progress
//! - [`results`]: result persistence, image extraction and archives
//! - [`server`] / [`cli`]: HTTP API and command line front ends

pub mod cli;
pub mod config;
pub mod gemini;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod results;
pub mod server;
