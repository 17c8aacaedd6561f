use crate::error::{CliError, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

/// A batch file as written on disk.
///
/// ```toml
/// [options]
/// max-bytes = 1048576
/// threads = 4
///
/// [[jobs]]
/// kind = "pfunc"
/// strands = ["GGGAAACCC"]
///
/// [[jobs]]
/// kind = "subopt"
/// strands = ["GGGAAACCC", "GGGUUUCCC"]
/// gap = 1.5
/// ```
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BatchFile {
    #[serde(default)]
    pub options: FileOptions,
    #[serde(default)]
    pub jobs: Vec<FileJob>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileOptions {
    pub max_bytes: Option<usize>,
    pub threads: Option<usize>,
    pub cache_complexes: Option<bool>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(
    tag = "kind",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case",
    deny_unknown_fields
)]
pub enum FileJob {
    Pfunc {
        strands: Vec<String>,
    },
    Mfe {
        strands: Vec<String>,
    },
    Pairs {
        strands: Vec<String>,
        #[serde(default)]
        diagonal_only: bool,
        #[serde(default)]
        threshold: f64,
    },
    Costs {
        strands: Vec<String>,
    },
    Sample {
        strands: Vec<String>,
        number: usize,
        seed: Option<u64>,
    },
    Subopt {
        strands: Vec<String>,
        gap: f64,
        max_number: Option<usize>,
    },
}

impl FileJob {
    pub fn strands(&self) -> &[String] {
        match self {
            FileJob::Pfunc { strands }
            | FileJob::Mfe { strands }
            | FileJob::Pairs { strands, .. }
            | FileJob::Costs { strands }
            | FileJob::Sample { strands, .. }
            | FileJob::Subopt { strands, .. } => strands,
        }
    }
}

impl BatchFile {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Reading batch file from {:?}", path);
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CliError::BatchParsing {
            path: path.to_path_buf(),
            source: e,
        })
    }
}
