//! Terraform variables file (`*.tfvars.json`) describing the cluster shape

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Error;
use crate::Result;

/// Counts appear as numbers or as quoted strings depending on who wrote the file.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
enum Count {
    Number(usize),
    Text(String),
}

impl Count {
    fn value(&self, field: &str) -> Result<usize> {
        match self {
            Count::Number(n) => Ok(*n),
            Count::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| Error::config(format!("{} is not a number: {:?}", field, s))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTfVars {
    tectonic_cluster_name: Option<String>,
    tectonic_master_count: Option<Count>,
    tectonic_worker_count: Option<Count>,
}

/// Cluster shape read from the variables file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TfVars {
    /// Source file
    pub path: PathBuf,
    /// Cluster name prefix
    pub prefix: String,
    /// Control-plane node count
    pub master_count: usize,
    /// Worker node count
    pub worker_count: usize,
}

impl TfVars {
    /// Read and parse a variables file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &content)
    }

    /// Parse variables file content
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let raw: RawTfVars = serde_json::from_str(content)
            .map_err(|e| Error::config(format!("invalid tfvars {}: {}", path.display(), e)))?;

        let prefix = raw
            .tectonic_cluster_name
            .ok_or_else(|| Error::config("tectonic_cluster_name missing from tfvars"))?;
        let master_count = match raw.tectonic_master_count {
            Some(c) => c.value("tectonic_master_count")?,
            None => 1,
        };
        let worker_count = match raw.tectonic_worker_count {
            Some(c) => c.value("tectonic_worker_count")?,
            None => 0,
        };

        Ok(Self {
            path: path.to_path_buf(),
            prefix,
            master_count,
            worker_count,
        })
    }

    /// Nodes expected once the cluster is up
    pub fn node_count(&self) -> usize {
        self.master_count + self.worker_count
    }
}
