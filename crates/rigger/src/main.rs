use anyhow::Result;
use clap::Parser;
use rigger_core::pipeline::StageFailure;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> Result<()> {
    let parsed = cli::Cli::parse();

    match parsed.dispatch().await {
        Ok(()) => Ok(()),
        Err(err) => {
            // Each failed stage has its own exit code; the stage already
            // printed its failure line
            if let Some(failure) = err.downcast_ref::<StageFailure>() {
                std::process::exit(failure.exit_code());
            }
            Err(err)
        }
    }
}
