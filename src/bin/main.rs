use ghoti::cli;

fn main() {
    let cli = cli::parse_from(std::env::args_os());
    std::process::exit(cli::run(cli));
}
