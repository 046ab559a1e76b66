//! Scheduler kernel unit tests
//!
//! Round-level behavior is exercised against a hand-driven clock; the
//! full host-facing scenarios live in `tests/integration.rs`.
