//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `run`     | `Run`            |
//! | `prs`     | `Prs`            |
//! | `history` | `History`        |
//! | `config`  | `Config`         |

pub mod config;
pub mod history;
pub mod prs;
pub mod run;

pub use config::cmd_config;
pub use history::cmd_history;
pub use prs::cmd_prs;
pub use run::cmd_run;
