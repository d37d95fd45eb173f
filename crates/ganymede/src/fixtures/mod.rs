//
// fixtures/mod.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! Test utilities for ganymede's unit and integration tests.

mod dummy_prover;

pub use dummy_prover::*;
