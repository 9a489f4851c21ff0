// src/router/memory/mod.rs

//! In-memory router.
//!
//! A pure in-process backend with PubSub semantics: the reference behaviour
//! the broker-backed routers approximate, and the backend tests run against.
//!
//! ## Reference Semantics
//!
//! - Once `accept()` returns, messages sent to the pipe afterwards are
//!   deliverable.
//! - Every accepted pipe is a queue group: each message goes to exactly one
//!   subscriber of the pipe, chosen round-robin across every router of the
//!   process.
//! - A message sent to a pipe nobody accepts is dropped.
//! - `get()` reaches the responder registered under the service name it is
//!   addressed to; without one it times out.
//!
//! ## Non-Goals
//!
//! No persistence, no network, no emulation of broker failure modes.

mod hub;
mod router;

pub(crate) use router::MemoryRouter;
