use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the test suite
    Test,
    /// Run the receiver simulator against an image
    Simulate {
        /// Firmware image to send
        image: PathBuf,
        /// Use sequenced framing
        #[arg(long)]
        sequenced: bool,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build", "--workspace"], "Build")?;
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"], "Test")?;
        }
        Commands::Simulate { image, sequenced } => {
            println!("Simulating OTA transfer...");
            let image = image.to_string_lossy().into_owned();
            let mut args = vec!["run", "-p", "bleota-cli", "--", "simulate", "--image", image.as_str()];
            if *sequenced {
                args.push("--sequenced");
            }
            cargo(&args, "Simulation")?;
        }
    }

    Ok(())
}
