//! Draftline: a checkpointed pipeline engine for long-form text orders.
//!
//! An order flows through a fixed graph of stages (analyze, draft, cite,
//! check, revise, humanize, reference, finish). Three bounded feedback loops
//! keep re-working the draft until length, quality and originality pass or
//! their bound is spent. Every stage completion is checkpointed, so a
//! restarted process resumes each run from the next stage.

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod errors;
pub mod graph;
pub mod orchestrator;
pub mod services;
pub mod stage;
pub mod state;
pub mod supervisor;
pub mod text;
