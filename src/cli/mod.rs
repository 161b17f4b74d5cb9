//! Command-line surface: `run`, `version`, and `benchmark`.

use std::ffi::OsString;

use clap::{Parser, Subcommand};

mod benchmark;
mod run;

pub use benchmark::BenchmarkArgs;
pub use run::RunArgs;

#[derive(Parser, Debug)]
#[command(
    name = "ghoti",
    version,
    about = "A simple server to do simple things, but fast!",
    long_about = "Ghoti is a server that performs simple tasks in a reliable and fast way.\n\n\
Distributed systems are complicated, sometimes is good to have a centralized way to \
perform some tasks to simplify the overall architecture."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an instance of the Ghoti server.
    Run(RunArgs),

    /// Return the Ghoti version.
    Version,

    /// Run a set of benchmarks against a Ghoti server.
    Benchmark(BenchmarkArgs),
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

/// Dispatch a parsed command line; the return value is the process exit
/// code.
pub fn run(cli: Cli) -> i32 {
    match cli.command {
        Commands::Run(args) => run::execute(args),
        Commands::Version => {
            println!(
                "Ghoti version `{}` built from `{}` on `{}`",
                env!("CARGO_PKG_VERSION"),
                option_env!("GHOTI_BUILD_COMMIT").unwrap_or("unknown"),
                option_env!("GHOTI_BUILD_DATE").unwrap_or("unknown"),
            );
            0
        }
        Commands::Benchmark(args) => benchmark::execute(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_addr() {
        let cli = parse_from(["ghoti", "run", "--addr", "localhost:1234"]);
        match cli.command {
            Commands::Run(args) => assert_eq!(args.addr.as_deref(), Some("localhost:1234")),
            other => panic!("expected run command, got {other:?}"),
        }
    }

    #[test]
    fn parses_version() {
        let cli = parse_from(["ghoti", "version"]);
        assert!(matches!(cli.command, Commands::Version));
    }

    #[test]
    fn parses_benchmark_defaults() {
        let cli = parse_from(["ghoti", "benchmark"]);
        match cli.command {
            Commands::Benchmark(args) => {
                assert_eq!(args.connections, 1000);
                assert_eq!(args.rounds, 10_000);
            }
            other => panic!("expected benchmark command, got {other:?}"),
        }
    }
}
