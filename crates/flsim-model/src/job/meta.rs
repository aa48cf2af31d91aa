use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ALL_SITES, SERVER_SITE, SiteName};

/// App name -> participants that run it.
pub type DeployMap = BTreeMap<String, Vec<SiteName>>;

/// Participant entry recorded in the job metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobClient {
    pub name: SiteName,
}

/// Job metadata (`meta.json`).
///
/// Only the fields the simulator reads are typed; everything else is kept
/// verbatim in `extra` and written back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub deploy_map: DeployMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_clients: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub job_clients: Vec<JobClient>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobMeta {
    /// Returns `true` if the participant list is the single `@ALL` wildcard.
    pub fn is_all_sites(participants: &[SiteName]) -> bool {
        participants.len() == 1 && participants[0].eq_ignore_ascii_case(ALL_SITES)
    }

    /// Client names mentioned explicitly in the deploy map, in map order.
    pub fn client_names(&self) -> Vec<SiteName> {
        let mut names: Vec<SiteName> = Vec::new();
        for participants in self.deploy_map.values() {
            for p in participants {
                if p.eq_ignore_ascii_case(ALL_SITES) || p == SERVER_SITE {
                    continue;
                }
                if !names.contains(p) {
                    names.push(p.clone());
                }
            }
        }
        names
    }

    /// Returns `true` if some app is deployed to `name` (explicitly or through `@ALL`).
    pub fn covers(&self, name: &str) -> bool {
        self.deploy_map
            .values()
            .any(|participants| Self::is_all_sites(participants) || participants.iter().any(|p| p == name))
    }

    /// Participants of one app after `@ALL` expansion against the run's clients.
    pub fn expand_participants(participants: &[SiteName], clients: &[SiteName]) -> Vec<SiteName> {
        if Self::is_all_sites(participants) {
            let mut all = vec![SERVER_SITE.to_string()];
            all.extend(clients.iter().cloned());
            all
        } else {
            participants.to_vec()
        }
    }
}
