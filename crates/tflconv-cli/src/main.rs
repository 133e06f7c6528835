//! tflconv CLI - convert PyTorch checkpoints into TensorFlow Lite models

mod checkpoint;
mod config;
mod convert;
mod inspect;
mod logging;

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "tflconv")]
#[command(author, version, about = "Convert PyTorch checkpoints into TensorFlow Lite models")]
#[command(long_about = "tflconv loads a PyTorch (.pt) or SafeTensors checkpoint, builds a sequential layer graph, \
transfers weights into it and writes a TensorFlow Lite (.tflite) FlatBuffer.\n\n\
Running without arguments converts big-lama.pt into lama_model.tflite.")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    convert: convert::ConvertArgs,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a checkpoint to a TFLite model (the default command)
    Convert(convert::ConvertArgs),

    /// Show information about a checkpoint or TFLite model
    Inspect {
        /// Checkpoint (.pt, .safetensors) or model (.tflite) file
        file: PathBuf,

        /// List every tensor
        #[arg(long)]
        tensors: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet);

    match cli.command.unwrap_or(Commands::Convert(cli.convert)) {
        Commands::Convert(args) => match convert::run(&args, !cli.quiet) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error converting model: {:#}", e);
                ExitCode::FAILURE
            }
        },
        Commands::Inspect {
            file,
            tensors,
            json,
        } => match inspect::run(&file, tensors, json) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error inspecting {}: {:#}", file.display(), e);
                ExitCode::FAILURE
            }
        },
    }
}
