//! Style Enforcement Tests
//!
//! Scans the workspace crates' `src/` trees for patterns that clippy does not
//! reject on its own.
//!
//! - `production_code` - No dead code allowances, no `unwrap()`/`expect()`
//!   outside test modules

#[path = "style/production_code.rs"]
mod production_code;
