//! CLI command implementations.
//!
//! | Module   | Commands handled        |
//! |----------|-------------------------|
//! | `run`    | `Run`, `Epic`, `Finalize` |
//! | `report` | `List`, `Status`        |

pub mod report;
pub mod run;

pub use report::{cmd_list, cmd_status};
pub use run::{run_all, run_epic, run_finalize};
