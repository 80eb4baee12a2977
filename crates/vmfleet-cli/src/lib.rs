//! vmfleet CLI — argument handling and the execution driver.
//!
//! # Components
//!
//! - **`args`** — clap arguments merged over `fleet.toml`
//! - **`driver`** — topology, reservation and deployment in sequence
//! - **`program`** — the optional post-deployment program

pub mod args;
pub mod driver;
pub mod program;

pub use args::Args;
pub use driver::{Driver, RunError, RunRequest, RunResult, log_summary};
pub use program::run_program;
