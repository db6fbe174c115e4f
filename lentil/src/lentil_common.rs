pub use log::{info, warn};
pub use std::path::{Path, PathBuf};

pub use candle_util::candle_image_data_loader::*;
pub use candle_util::{candle_core, candle_nn};

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};

/// named scalar losses in a stable order
pub type LossMap = BTreeMap<Box<str>, f32>;

pub const OPTIONS_FILE: &str = "opt.json";
pub const ITER_RECORD_FILE: &str = "iter.json";

/// Checkpoints are keyed either by `latest` or an epoch number
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointLabel {
    Latest,
    Epoch(usize),
}

impl std::fmt::Display for CheckpointLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Epoch(e) => write!(f, "{}", e),
        }
    }
}

impl std::str::FromStr for CheckpointLabel {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        if s.eq_ignore_ascii_case("latest") {
            Ok(Self::Latest)
        } else {
            let epoch = s
                .parse::<usize>()
                .map_err(|_| anyhow::anyhow!("checkpoint label should be `latest` or an epoch: {}", s))?;
            Ok(Self::Epoch(epoch))
        }
    }
}

/// Buffered writer; gzipped if the file name ends with `.gz`
pub fn open_buf_writer(output_file: &Path) -> anyhow::Result<Box<dyn Write>> {
    let ext = output_file.extension().and_then(|x| x.to_str());
    let file = File::create(output_file)?;
    match ext {
        Some("gz") => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            Ok(Box::new(BufWriter::new(encoder)))
        }
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

/// Buffered writer appending to a (possibly new) file
pub fn open_append_writer(output_file: &Path) -> anyhow::Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(output_file)?;
    Ok(BufWriter::new(file))
}
