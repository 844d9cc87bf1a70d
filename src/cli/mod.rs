pub mod check_config;
pub mod run;
pub mod runtime;

pub use check_config::cmd_check_config;
pub use run::cmd_run;
pub use runtime::init_logging;
