//! CLI command implementations.
//!
//! | Module    | Commands handled                   |
//! |-----------|------------------------------------|
//! | `run`     | `Run`, `Resume`                    |
//! | `inspect` | `Status`, `Checkpoints`, `Orders`  |
//! | `config`  | `Config`                           |

pub mod config;
pub mod inspect;
pub mod run;

pub use config::cmd_config;
pub use inspect::{cmd_checkpoints, cmd_orders, cmd_status};
pub use run::{cmd_resume, cmd_run};
