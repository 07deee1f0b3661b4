use clap::Parser;

use abductio::cli_app::{Cli, init_tracing, run};

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(err) = run(&cli) {
        eprintln!("abx: {err}");
        std::process::exit(1);
    }
}
