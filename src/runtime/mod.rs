//! Worker runtime: uniform lifecycle for every worker in the
//! pipeline.
//!
//! A worker is a single cooperative task. The runner wires its
//! subscriptions to durable `<worker>.<topic>` queues, drives the
//! main loop (one message at a time, optional periodic tick, optional
//! internal event source), and funnels every exit path through
//! cleanup. Handler and tick failures are logged with context and
//! never tear the worker down; only setup failures abort start.

mod worker;

pub use worker::{Worker, WorkerHandle, publish, run_worker, spawn_worker};
