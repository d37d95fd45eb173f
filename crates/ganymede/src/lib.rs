//
// lib.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

pub mod boundaries;
pub mod buffer;
pub mod cancel;
pub mod controller;
pub mod error;
pub mod goals;
pub mod prover;
pub mod sentence;
pub mod stm;

#[cfg(any(test, feature = "testing"))]
pub mod fixtures;

pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;
