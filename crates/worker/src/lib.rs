//! Multi-GPU batch image generation controller.
//!
//! The [`scheduler`] compiles prompt templates into jobs and hands them to
//! one render process per GPU ([`pool`]); the [`executor`] runs each job
//! against its device and [`output`] files the results.

pub mod config;
pub mod executor;
pub mod observe;
pub mod output;
pub mod pool;
pub mod scheduler;
pub mod shutdown;
