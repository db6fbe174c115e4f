use crate::lentil_common::*;
use crate::pix2pix_model::{NetworkKind, Pix2PixModel};
use crate::train_options::{ComputeDevice, LossConfig, ModelConfig};

use candle_util::candle_data_loader_util::tensor_to_gray_images;
use clap::Args;
use rayon::prelude::*;
use std::io::Write;

pub const LATENT_FILE: &str = "latent.tsv.gz";

#[derive(Args, Debug)]
pub struct GenerateArgs {
    #[arg(long, short, default_value = "label2image", help = "Experiment name")]
    pub name: Box<str>,

    #[arg(long, default_value = "checkpoints", help = "Checkpoint directory")]
    pub checkpoints_dir: Box<str>,

    #[arg(
        long,
        short = 'd',
        required = true,
        help = "Data root",
        long_help = "Data root with `label/` conditioning maps and\n\
		     `style/` (or `image/`) style references."
    )]
    pub dataroot: Box<str>,

    #[arg(
        long,
        short,
        default_value = "results",
        help = "Output directory",
        long_help = "Output directory.\n\
		     Images and latent codes go to {results_dir}/{name}/{which_epoch}/"
    )]
    pub results_dir: Box<str>,

    #[arg(long, default_value = "latest", help = "Checkpoint to use: latest or an epoch")]
    pub which_epoch: Box<str>,

    #[arg(long, short = 'b', default_value_t = 1, help = "Minibatch size")]
    pub batch_size: usize,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    pub device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "A device for cuda")]
    pub device_no: usize,

    #[arg(long, short, help = "Verbosity")]
    pub verbose: bool,
}

pub fn run_generate(args: &GenerateArgs) -> anyhow::Result<()> {
    let label: CheckpointLabel = args.which_epoch.parse()?;
    if args.batch_size == 0 {
        anyhow::bail!("batch size should be positive");
    }

    let experiment_dir = Path::new(&*args.checkpoints_dir).join(&*args.name);
    let config = ModelConfig::from_json(&experiment_dir.join(OPTIONS_FILE))?;
    info!("{:?}", config);

    let dev = args.device.to_device(args.device_no)?;

    let mut model = Pix2PixModel::new(&config, LossConfig::default(), &dev)?;
    model.load(
        &experiment_dir,
        label,
        &[NetworkKind::Encoder, NetworkKind::Generator],
    )?;

    let mut data = ImageFolderData::new(Path::new(&*args.dataroot), config.transform(false), false)?;
    data.shuffle_minibatch(args.batch_size)?;

    let out_dir = Path::new(&*args.results_dir)
        .join(&*args.name)
        .join(label.to_string());
    std::fs::create_dir_all(&out_dir)?;

    let mut latent_out = open_buf_writer(&out_dir.join(LATENT_FILE))?;

    let pb = indicatif::ProgressBar::new(data.num_minibatch() as u64);
    if args.verbose {
        pb.set_draw_target(indicatif::ProgressDrawTarget::hidden());
    }

    for b in 0..data.num_minibatch() {
        let batch = data.minibatch_data(b, &dev)?;
        let z = model.encode_mean(&batch.style)?;
        let fake = model.synthesize(&batch.label, &z)?;

        let images = tensor_to_gray_images(&fake)?;
        images
            .par_iter()
            .zip(batch.names.par_iter())
            .map(|(img, name)| -> anyhow::Result<()> {
                img.save(out_dir.join(format!("{}.png", name)))?;
                Ok(())
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let z = z.to_device(&candle_core::Device::Cpu)?.to_vec2::<f32>()?;
        for (name, row) in batch.names.iter().zip(z.iter()) {
            let row = row.iter().map(|x| x.to_string()).collect::<Vec<_>>();
            writeln!(latent_out, "{}\t{}", name, row.join("\t"))?;
        }
        pb.inc(1);
    }
    pb.finish_and_clear();
    latent_out.flush()?;

    info!(
        "generated {} images in {}",
        data.num_samples(),
        out_dir.display()
    );
    Ok(())
}
