//! Job package loading, validation and deployment into the simulator workspace.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use flsim_model::{
    ALL_SITES, CONFIG_FOLDER, JOB_META_FILE, JOB_NAME, JobClient, JobMeta, SERVER_SITE, SiteName,
};

use crate::{
    error::{SimError, SimResult},
    workspace::{SiteLayout, copy_tree},
};

/// A validated job folder.
#[derive(Debug, Clone)]
pub struct JobPackage {
    folder: PathBuf,
    meta: JobMeta,
    /// App name -> folder holding that app.
    apps: BTreeMap<String, PathBuf>,
}

impl JobPackage {
    /// Load and validate the job at `folder`.
    ///
    /// A folder without `meta.json` but with a `config` directory is a single
    /// app deployed to every site.
    pub fn load(folder: &Path) -> SimResult<Self> {
        if !folder.is_dir() {
            return Err(SimError::InvalidJobDefinition(format!(
                "job folder {} does not exist",
                folder.display()
            )));
        }

        let meta_path = folder.join(JOB_META_FILE);
        let (meta, apps) = if meta_path.is_file() {
            let raw = fs::read_to_string(&meta_path).map_err(|e| SimError::io(&meta_path, e))?;
            let meta: JobMeta = serde_json::from_str(&raw).map_err(|e| {
                SimError::InvalidJobDefinition(format!("{}: {e}", meta_path.display()))
            })?;
            let apps = meta
                .deploy_map
                .keys()
                .map(|app| (app.clone(), folder.join(app)))
                .collect();
            (meta, apps)
        } else if folder.join(CONFIG_FOLDER).is_dir() {
            let app = folder
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| JOB_NAME.to_string());
            debug!(target: "flsim.core.job", app = %app, "job folder without meta.json, deploying as single app");
            let meta = JobMeta {
                name: app.clone(),
                deploy_map: BTreeMap::from([(app.clone(), vec![ALL_SITES.to_string()])]),
                ..Default::default()
            };
            (meta, BTreeMap::from([(app, folder.to_path_buf())]))
        } else {
            return Err(SimError::InvalidJobDefinition(format!(
                "{} has neither {JOB_META_FILE} nor a {CONFIG_FOLDER} folder",
                folder.display()
            )));
        };

        let package = Self {
            folder: folder.to_path_buf(),
            meta,
            apps,
        };
        package.validate()?;
        Ok(package)
    }

    fn validate(&self) -> SimResult<()> {
        let deploy_map = &self.meta.deploy_map;
        if deploy_map.is_empty() {
            return Err(invalid("deploy_map is empty"));
        }

        let mut owner: HashMap<&str, &str> = HashMap::new();
        for (app, participants) in deploy_map {
            let dir = &self.apps[app];
            if !dir.join(CONFIG_FOLDER).is_dir() {
                return Err(invalid(format!(
                    "app {app} has no {CONFIG_FOLDER} folder at {}",
                    dir.display()
                )));
            }
            if participants.is_empty() {
                return Err(invalid(format!("app {app} has no participants")));
            }
            if JobMeta::is_all_sites(participants) {
                if deploy_map.len() > 1 {
                    return Err(invalid(format!(
                        "app {app} is deployed to {ALL_SITES} but the job has other apps"
                    )));
                }
                continue;
            }
            for site in participants {
                if site.eq_ignore_ascii_case(ALL_SITES) {
                    return Err(invalid(format!(
                        "{ALL_SITES} must be the only participant of app {app}"
                    )));
                }
                if let Some(other) = owner.insert(site.as_str(), app.as_str()) {
                    return Err(invalid(format!(
                        "site {site} is deployed to both {other} and {app}"
                    )));
                }
            }
        }

        if !self.meta.covers(SERVER_SITE) {
            return Err(invalid("no app is deployed to the server"));
        }
        Ok(())
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn meta(&self) -> &JobMeta {
        &self.meta
    }

    /// Client names named in the deploy map.
    pub fn client_names(&self) -> Vec<SiteName> {
        self.meta.client_names()
    }

    /// Every requested client must be covered by a deploy-map entry.
    pub fn validate_client_names(&self, clients: &[SiteName]) -> SimResult<()> {
        let missing: Vec<&str> = clients
            .iter()
            .filter(|c| !self.meta.covers(c))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(invalid(format!(
                "the job does not have an app for clients: {missing:?}"
            )))
        }
    }

    /// Source folder of the app deployed to `site`.
    pub fn app_for(&self, site: &str, clients: &[SiteName]) -> Option<&Path> {
        self.meta.deploy_map.iter().find_map(|(app, participants)| {
            JobMeta::expand_participants(participants, clients)
                .iter()
                .any(|p| p == site)
                .then(|| self.apps[app].as_path())
        })
    }

    /// Copy every app into its participants' app roots and write the run's
    /// job metadata into the server's and every client's job folder.
    pub fn deploy(&self, layout: &SiteLayout, clients: &[SiteName]) -> SimResult<JobMeta> {
        let mut meta = self.meta.clone();
        meta.job_clients = clients
            .iter()
            .map(|name| JobClient { name: name.clone() })
            .collect();

        let sites = std::iter::once(SERVER_SITE.to_string()).chain(clients.iter().cloned());
        for site in sites {
            let Some(app) = self.app_for(&site, clients) else {
                continue;
            };
            let dst = layout.app_root(&site);
            copy_tree(app, &dst)?;

            let meta_file = layout.meta_file(&site);
            let raw = serde_json::to_string_pretty(&meta).map_err(|e| SimError::json(&meta_file, e))?;
            fs::write(&meta_file, raw).map_err(|e| SimError::io(&meta_file, e))?;
            debug!(target: "flsim.core.job", site = %site, app = %app.display(), "app deployed");
        }

        info!(target: "flsim.core.job", job = %meta.name, clients = clients.len(), "job deployed");
        Ok(meta)
    }
}

fn invalid(msg: impl Into<String>) -> SimError {
    SimError::InvalidJobDefinition(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(root: &Path, name: &str) {
        fs::create_dir_all(root.join(name).join("config")).unwrap();
        fs::write(
            root.join(name).join("config/config_fed_client.json"),
            br#"{"command":"true"}"#,
        )
        .unwrap();
    }

    fn job(deploy_map: &str, apps: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for a in apps {
            app(dir.path(), a);
        }
        fs::write(
            dir.path().join("meta.json"),
            format!(r#"{{"name":"hello","deploy_map":{deploy_map},"resource_spec":{{}}}}"#),
        )
        .unwrap();
        dir
    }

    fn names(v: &[&str]) -> Vec<SiteName> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn loads_valid_multi_app_job() {
        let dir = job(
            r#"{"app_server":["server"],"app_a":["site-a"],"app_b":["site-b"]}"#,
            &["app_server", "app_a", "app_b"],
        );
        let pkg = JobPackage::load(dir.path()).unwrap();
        assert_eq!(pkg.client_names(), names(&["site-a", "site-b"]));
        assert!(pkg.validate_client_names(&names(&["site-a", "site-b"])).is_ok());

        let err = pkg.validate_client_names(&names(&["site-a", "site-c"])).unwrap_err();
        assert!(matches!(err, SimError::InvalidJobDefinition(ref m) if m.contains("site-c")));
    }

    #[test]
    fn rejects_bad_packages() {
        let dir = job(r#"{}"#, &[]);
        assert!(JobPackage::load(dir.path()).is_err());

        let dir = job(r#"{"app":["server","site-1"]}"#, &[]);
        assert!(JobPackage::load(dir.path()).is_err(), "missing app folder");

        let dir = job(
            r#"{"a":["server","site-1"],"b":["site-1"]}"#,
            &["a", "b"],
        );
        assert!(JobPackage::load(dir.path()).is_err(), "site in two apps");

        let dir = job(r#"{"a":["site-1"]}"#, &["a"]);
        assert!(JobPackage::load(dir.path()).is_err(), "no server app");

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("meta.json"), b"not json").unwrap();
        assert!(matches!(
            JobPackage::load(dir.path()),
            Err(SimError::InvalidJobDefinition(_))
        ));
    }

    #[test]
    fn legacy_folder_is_deployed_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let job_dir = dir.path().join("hello");
        fs::create_dir_all(job_dir.join("config")).unwrap();

        let pkg = JobPackage::load(&job_dir).unwrap();
        assert!(pkg.validate_client_names(&names(&["x", "y"])).is_ok());
        assert_eq!(pkg.app_for("x", &names(&["x"])), Some(job_dir.as_path()));
    }

    #[test]
    fn deploy_copies_apps_and_writes_meta() {
        let dir = job(r#"{"app":["@ALL"]}"#, &["app"]);
        let ws = tempfile::tempdir().unwrap();
        let layout = SiteLayout::new(ws.path());
        let clients = names(&["site-1", "site-2"]);

        let pkg = JobPackage::load(dir.path()).unwrap();
        let meta = pkg.deploy(&layout, &clients).unwrap();
        assert_eq!(meta.job_clients.len(), 2);

        for site in ["server", "site-1", "site-2"] {
            assert!(layout.config_dir(site).join("config_fed_client.json").is_file());
            let raw = fs::read_to_string(layout.meta_file(site)).unwrap();
            let written: JobMeta = serde_json::from_str(&raw).unwrap();
            assert_eq!(written.job_clients, meta.job_clients);
            assert!(written.extra.contains_key("resource_spec"));
        }
    }
}
