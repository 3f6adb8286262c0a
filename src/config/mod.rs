//! Configuration for thinknode.
//!
//! Settings come from `config.kdl` in the data directory (or the file named
//! by `--config`), overridden by CLI flags and their environment variables.
//! Use the [`resolver`] module for precedence resolution.

pub mod resolver;
pub mod schema;

pub use resolver::{ConfigOverrides, Resolved, ResolvedConfig, ValueSource, resolve_config};
pub use schema::{CONFIG_FILE_NAME, ThinknodeConfig};
