use std::process::ExitCode;

use rv_tree::cli::CommandLineInterface;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let command_line_interface = CommandLineInterface::load();

    // Logs go to stderr so a tree written to stdout stays clean for piping.
    let level = command_line_interface.verbose.tracing_level_filter();
    let filter = EnvFilter::new(format!("warn,rv_tree={level}"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match command_line_interface.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}
