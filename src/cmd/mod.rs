//! CLI command implementations.
//!
//! | Module      | Commands handled                           |
//! |-------------|---------------------------------------------|
//! | `migrate`   | `Migrate`                                   |
//! | `serve`     | `Serve`                                     |
//! | `run`       | `Run`                                       |
//! | `operator`  | `Operator`                                  |

pub mod migrate;
pub mod operator;
pub mod run;
pub mod serve;

pub use migrate::cmd_migrate;
pub use operator::cmd_operator;
pub use run::cmd_run;
pub use serve::cmd_serve;
