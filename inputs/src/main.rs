use clap::Parser;
use prover_inputs::cli::Cli;
use prover_inputs::stages;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = cli.run().await {
        eprintln!("prover-inputs: {err}");
        std::process::exit(stages::exit_code(&err));
    }
}
