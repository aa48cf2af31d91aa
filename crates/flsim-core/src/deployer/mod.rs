//! Builds the per-run deployment artifacts handed to client workers.

use serde_json::{Value, json};
use uuid::Uuid;

use flsim_model::{
    BuildContext, CLIENT_JOB_CONFIG, CONFIG_FOLDER, DeployArgs, ENVIRONMENT_CONFIG, JOB_NAME,
    KeyValue, SiteName,
};

use crate::{
    slot::{Client, ClientEndpoint, ClientSlot},
    workspace::SiteLayout,
};

/// Splits `scheme://target`; a URL without a scheme is treated as tcp.
pub fn split_url(url: &str) -> (&str, &str) {
    url.split_once("://").unwrap_or(("tcp", url))
}

#[derive(Debug, Clone)]
pub struct SimulatorDeployer {
    layout: SiteLayout,
}

impl SimulatorDeployer {
    pub fn new(layout: SiteLayout) -> Self {
        Self { layout }
    }

    /// Deploy arguments shared by every client; rebased per client at dispatch.
    pub fn deploy_args(&self, root_url: &str, set: &[KeyValue]) -> DeployArgs {
        let (scheme, target) = split_url(root_url);
        DeployArgs {
            workspace: self.layout.root().to_path_buf(),
            job_id: JOB_NAME.to_string(),
            config_folder: CONFIG_FOLDER.to_string(),
            client_config: [CONFIG_FOLDER, CLIENT_JOB_CONFIG].iter().collect(),
            env: [CONFIG_FOLDER, ENVIRONMENT_CONFIG].iter().collect(),
            sp_target: target.to_string(),
            sp_scheme: scheme.to_string(),
            set: set.to_vec(),
        }
    }

    /// Client startup config pointing every worker at the simulated server.
    pub fn client_config(&self, root_url: &str) -> Value {
        let (scheme, target) = split_url(root_url);
        json!({
            "format_version": 2,
            "servers": [{
                "name": JOB_NAME,
                "service": { "scheme": scheme, "target": target },
            }],
            "client": { "retry_timeout": 30 },
        })
    }

    pub fn build_ctx(&self, root_url: &str) -> BuildContext {
        let mut ctx = BuildContext::new();
        ctx.insert("simulator_root", self.layout.root().display().to_string());
        ctx.insert("secure_train", false);
        ctx.insert("server_root_url", root_url);
        ctx.insert("job_id", JOB_NAME);
        ctx
    }

    /// One slot per name, each with a fresh token.
    pub fn create_clients(
        &self,
        names: &[SiteName],
        root_url: &str,
        parent_url: &str,
    ) -> Vec<ClientSlot> {
        names
            .iter()
            .map(|name| {
                let client = Client::new(
                    name.as_str(),
                    Uuid::new_v4().to_string(),
                    ClientEndpoint::new(root_url, parent_url),
                );
                ClientSlot::new(client, self.layout.client_paths(name))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, path::PathBuf};

    use super::*;

    #[test]
    fn deploy_args_target_the_root_listener() {
        let deployer = SimulatorDeployer::new(SiteLayout::new("/ws"));
        let set = vec![KeyValue::new("simulator_worker_timeout", "5")];
        let args = deployer.deploy_args("tcp://127.0.0.1:4000", &set);

        assert_eq!(args.sp_scheme, "tcp");
        assert_eq!(args.sp_target, "127.0.0.1:4000");
        assert_eq!(args.client_config, PathBuf::from("config/config_fed_client.json"));
        assert_eq!(args.workspace, PathBuf::from("/ws"));
        assert_eq!(args.set, set);
    }

    #[test]
    fn clients_get_distinct_tokens_and_paths() {
        let deployer = SimulatorDeployer::new(SiteLayout::new("/ws"));
        let names = vec!["site-1".to_string(), "site-2".to_string()];
        let slots = deployer.create_clients(&names, "tcp://a", "tcp://b");

        let tokens: HashSet<_> = slots.iter().map(|s| s.client().token.clone()).collect();
        assert_eq!(tokens.len(), 2);
        assert_eq!(slots[1].paths().workspace, PathBuf::from("/ws/site-2"));
        assert_eq!(slots[0].client().endpoint.parent_url, "tcp://b");
    }

    #[test]
    fn url_without_scheme_defaults_to_tcp() {
        assert_eq!(split_url("host:1"), ("tcp", "host:1"));
        assert_eq!(split_url("grpc://host:1"), ("grpc", "host:1"));
    }
}
