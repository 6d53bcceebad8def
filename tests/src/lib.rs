//! # Parallel-Ledger Test Suite
//!
//! Unified test crate covering cross-module behavior of the state
//! database:
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── lifecycle.rs    # journal, finalise, intermediate root, commit
//!     ├── destruction.rs  # storage wipes and reverse-diff accounting
//!     └── parallel.rs     # multi-version reads, aborts, validation
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p pl-tests
//! cargo test -p pl-tests integration::
//! ```

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod integration;
