//! Scenario tests for the tire-wear acquisition stack
//!
//! These tests run the connection manager, the acquisition session and the
//! daemon wiring together against mock USB and Bluetooth probes, so no
//! hardware is needed.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p tetires-tests
//! ```
//!
//! # Test Structure
//!
//! - `framing_test.rs` - record reassembly over arbitrary chunk splits
//! - `arbitration_test.rs` - transport priority, reconnect single-flight
//! - `scan_test.rs` - batch threshold, link loss, result map and save outcomes
//! - `daemon_test.rs` - console commands against a mock-backed daemon

// This crate only contains tests, no library code
