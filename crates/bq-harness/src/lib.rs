//! Conformance test harness: scenario integration tests and property-based
//! invariant checks live under `tests/`, driven against the in-memory
//! reference backend. This crate has no runtime surface of its own.
