//! CLI command implementations.
//!
//! | Module    | Commands handled            |
//! |-----------|-----------------------------|
//! | `serve`   | `Serve`                     |
//! | `config`  | `Config`                    |
//! | `logging` | tracing setup for all of them |

pub mod config;
pub mod logging;
pub mod serve;

pub use config::cmd_config;
pub use logging::init_tracing;
pub use serve::cmd_serve;
