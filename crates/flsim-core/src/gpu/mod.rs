//! GPU group parsing and thread/GPU budget resolution.

use std::process::Command;

use tracing::{debug, warn};

use crate::error::{SimError, SimResult};

/// Thread and GPU budget for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Budget {
    /// Worker count per scheduler partition.
    pub threads: usize,
    /// GPU groups, each a comma-separated id list (`"0,1"`). `None` runs without GPUs.
    pub gpu_groups: Option<Vec<String>>,
}

impl Budget {
    /// Number of scheduler partitions this budget asks for.
    pub fn partitions(&self) -> usize {
        self.gpu_groups.as_ref().map_or(1, Vec::len)
    }
}

/// Source of the GPU ids visible on this host.
pub trait GpuProbe: Send + Sync {
    fn gpu_ids(&self) -> Vec<String>;
}

/// Queries `nvidia-smi`; reports no GPUs when the tool is missing or fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NvidiaSmi;

impl GpuProbe for NvidiaSmi {
    fn gpu_ids(&self) -> Vec<String> {
        let output = match Command::new("nvidia-smi")
            .args(["--query-gpu=index", "--format=csv,noheader"])
            .output()
        {
            Ok(out) if out.status.success() => out,
            Ok(out) => {
                debug!(target: "flsim.core.gpu", status = %out.status, "nvidia-smi failed");
                return Vec::new();
            }
            Err(e) => {
                debug!(target: "flsim.core.gpu", error = %e, "nvidia-smi not available");
                return Vec::new();
            }
        };
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Fixed id list, for hosts whose GPUs are known up front.
#[derive(Debug, Clone, Default)]
pub struct FixedGpus(pub Vec<String>);

impl GpuProbe for FixedGpus {
    fn gpu_ids(&self) -> Vec<String> {
        self.0.clone()
    }
}

/// Parse a GPU option into groups.
///
/// Accepted forms: `[0,1],[2]` and `0,1;2` give explicit groups, a plain
/// `0,1,2` puts every id in its own group.
pub fn split_gpus(raw: &str) -> SimResult<Vec<String>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(SimError::Configuration("empty GPU list".into()));
    }

    let groups: Vec<&str> = if raw.contains('[') {
        let mut out = Vec::new();
        for piece in raw.split(']') {
            let piece = piece.trim().trim_start_matches(',').trim();
            if piece.is_empty() {
                continue;
            }
            let inner = piece.strip_prefix('[').ok_or_else(|| {
                SimError::Configuration(format!("GPUs group list option in wrong format: {raw}"))
            })?;
            out.push(inner);
        }
        out
    } else if raw.contains(';') {
        raw.split(';').collect()
    } else {
        raw.split(',').collect()
    };

    groups.into_iter().map(|g| normalize_group(g, raw)).collect()
}

fn normalize_group(group: &str, raw: &str) -> SimResult<String> {
    let ids = group
        .split(',')
        .map(str::trim)
        .map(|id| {
            id.parse::<u32>().map_err(|_| {
                SimError::Configuration(format!("invalid GPU id {id:?} in {raw:?}"))
            })
        })
        .collect::<SimResult<Vec<u32>>>()?;
    Ok(ids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(","))
}

/// Distribute `clients` round-robin over `groups` partitions.
pub fn split_clients<T>(clients: Vec<T>, groups: usize) -> Vec<Vec<T>> {
    let groups = groups.max(1);
    let mut out: Vec<Vec<T>> = (0..groups).map(|_| Vec::new()).collect();
    for (idx, client) in clients.into_iter().enumerate() {
        out[idx % groups].push(client);
    }
    out
}

/// Validate the requested threads/GPU options against the client count and host GPUs.
pub fn resolve_budget(
    threads: Option<usize>,
    gpu: Option<&str>,
    clients: usize,
    host_gpus: &[String],
) -> SimResult<Budget> {
    let mut threads = threads;
    let mut gpu_groups = None;

    if let Some(raw) = gpu {
        let groups = split_gpus(raw)?;

        if !host_gpus.is_empty() {
            let wrong: Vec<&str> = groups
                .iter()
                .flat_map(|g| g.split(','))
                .filter(|id| !host_gpus.iter().any(|h| h == id))
                .collect();
            if !wrong.is_empty() {
                return Err(SimError::Configuration(format!(
                    "these GPUs are not available: {wrong:?}"
                )));
            }
        }

        if groups.len() > clients {
            return Err(SimError::Configuration(format!(
                "the number of clients ({clients}) must be larger than or equal to the number of GPU groups ({})",
                groups.len()
            )));
        }

        if groups.len() > 1 {
            if threads.is_some_and(|t| t > 1) {
                warn!(
                    target: "flsim.core.gpu",
                    "when running with multi GPU, each GPU group runs with only 1 thread"
                );
            }
            threads = Some(1);
        }
        gpu_groups = Some(groups);
    }

    let threads = threads.unwrap_or(1);
    if threads == 0 {
        return Err(SimError::Configuration(
            "the number of threads must be at least 1".into(),
        ));
    }
    if threads > clients {
        return Err(SimError::Configuration(format!(
            "the number of threads ({threads}) must be less than or equal to the number of clients ({clients})"
        )));
    }

    Ok(Budget {
        threads,
        gpu_groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn split_gpus_accepts_all_forms() {
        assert_eq!(split_gpus("[0,1],[2]").unwrap(), vec!["0,1", "2"]);
        assert_eq!(split_gpus("0,1;2").unwrap(), vec!["0,1", "2"]);
        assert_eq!(split_gpus("0,1,2").unwrap(), vec!["0", "1", "2"]);
        assert_eq!(split_gpus(" [ 3 , 4 ] ").unwrap(), vec!["3,4"]);
    }

    #[test]
    fn split_gpus_rejects_garbage() {
        assert!(split_gpus("").is_err());
        assert!(split_gpus("a,b").is_err());
        assert!(split_gpus("0;;1").is_err());
        assert!(split_gpus("0,1],[2").is_err());
    }

    #[test]
    fn split_clients_round_robin() {
        let parts = split_clients(vec!["a", "b", "c", "d", "e"], 2);
        assert_eq!(parts, vec![vec!["a", "c", "e"], vec!["b", "d"]]);
        assert_eq!(split_clients(vec![1, 2], 0), vec![vec![1, 2]]);
    }

    #[test]
    fn multi_group_on_known_host_forces_single_thread() {
        let budget = resolve_budget(Some(4), Some("0,1;2"), 4, &host(&["0", "1", "2", "3"])).unwrap();
        assert_eq!(budget.threads, 1);
        assert_eq!(budget.gpu_groups, Some(vec!["0,1".to_string(), "2".to_string()]));
        assert_eq!(budget.partitions(), 2);
    }

    #[test]
    fn unknown_gpu_is_a_configuration_error() {
        let err = resolve_budget(None, Some("9"), 2, &host(&["0", "1", "2", "3"])).unwrap_err();
        assert!(matches!(err, SimError::Configuration(_)));
        assert!(err.is_setup_error());
    }

    #[test]
    fn host_without_gpus_skips_subset_check() {
        let budget = resolve_budget(None, Some("9"), 2, &[]).unwrap();
        assert_eq!(budget.threads, 1);
    }

    #[test]
    fn limits_against_client_count() {
        assert!(resolve_budget(None, Some("0;1;2"), 2, &[]).is_err());
        assert!(resolve_budget(Some(3), None, 2, &[]).is_err());
        assert!(resolve_budget(Some(0), None, 2, &[]).is_err());
        assert_eq!(resolve_budget(None, None, 2, &[]).unwrap().threads, 1);
        assert_eq!(resolve_budget(Some(2), Some("0"), 2, &[]).unwrap().threads, 2);
    }
}
