//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module       | Commands handled        |
//! |--------------|-------------------------|
//! | `train`      | `Train`                 |
//! | `state`      | `Status`, `Reset`       |
//! | `combine`    | `Combine`               |
//! | `submission` | `Submission`            |
//! | `config`     | `Config`                |

pub mod combine;
pub mod config;
pub mod state;
pub mod submission;
pub mod train;

pub use combine::cmd_combine;
pub use config::cmd_config;
pub use state::{cmd_reset, cmd_status};
pub use submission::cmd_submission;
pub use train::cmd_train;
