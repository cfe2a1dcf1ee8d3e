//! Core domain logic for the Dream Factory job engine.
//!
//! Everything in this crate is free of network and process concerns: the
//! typed job model, template parsing, directive resolution, wildcard
//! expansion, prompt compilation, queueing, sweep and seed policy,
//! trigger-phrase handling, and output naming. Warnings are returned as
//! values; the worker crate decides how to log them.

pub mod capabilities;
pub mod compiler;
pub mod directives;
pub mod error;
pub mod images;
pub mod job;
pub mod naming;
pub mod queue;
pub mod record;
pub mod sweep;
pub mod template;
pub mod text;
pub mod triggers;
pub mod upscale;
pub mod wildcards;
