mod iter_counter;
mod lentil_common;
mod pix2pix_model;
mod pix2pix_trainer;
mod run_generate;
mod run_train;
mod train_loop;
mod train_options;
mod validation;
mod visualizer;

use lentil_common::*;
use run_generate::*;
use run_train::*;
use train_options::TrainArgs;

use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LENTIL",
    long_about = "Label-conditioned image synthesis with a latent style encoder.\n\
		  A convolutional encoder maps a style image to a latent Gaussian;\n\
		  a SPADE generator renders the label map in that style;\n\
		  multiscale PatchGAN discriminators judge the result."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Train the encoder, generator and discriminators",
        long_about = "Train the networks on paired label/image folders.\n\
		      Checkpoints, losses and image grids are written to\n\
		      {checkpoints_dir}/{name}/. Ctrl-C stops after the current step\n\
		      and saves the latest model; resume with --continue-train.\n"
    )]
    Train(TrainArgs),

    #[command(
        about = "Synthesize images with a trained model",
        long_about = "Encode style images, synthesize from label maps and\n\
		      write PNG files with a table of latent means.\n"
    )]
    Generate(GenerateArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbose = match &cli.commands {
        Commands::Train(args) => args.verbose,
        Commands::Generate(args) => args.verbose,
    };
    if verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    match &cli.commands {
        Commands::Train(args) => {
            let stop = Arc::new(AtomicBool::new(false));
            {
                let stop = Arc::clone(&stop);
                ctrlc::set_handler(move || {
                    if stop.swap(true, Ordering::SeqCst) {
                        warn!("interrupted again; still waiting for the current step");
                    } else {
                        warn!("received Ctrl-C; stopping after the current step");
                    }
                })?;
            }
            run_train(args, stop)?;
        }
        Commands::Generate(args) => {
            run_generate(args)?;
        }
    }

    info!("Done");
    Ok(())
}
