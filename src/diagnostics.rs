use miette::Report;
use tracing::error;

use crate::config::RuntimeConfig;
use crate::runtime::error::CafError;

/// Renders `error` the way fatal failures are printed.
pub fn render(error: &CafError) -> String {
    format!("{:?}", Report::new(error.clone()))
}

/// Prints `error` to stderr and terminates the process.
pub fn fatal(error: &CafError, config: &RuntimeConfig) -> ! {
    error!(%error, exit_code = config.fatal_exit_code, "fatal coarray runtime error");
    eprintln!("Fortran runtime error: {}", render(error));
    std::process::exit(config.fatal_exit_code)
}
