//! Simulator workspace layout and cleanup.
//!
//! ```text
//! <root>/
//!   startup/ local/             kept across cleanups, copied into every site
//!   pid.rc                      supervisor exit code
//!   <site>/
//!     local/log_config.json
//!     startup/
//!     simulate_job/
//!       meta.json
//!       app_<site>/{config,custom}
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::debug;

use flsim_model::{
    CONFIG_FOLDER, CUSTOM_FOLDER, JOB_META_FILE, JOB_NAME, LOCAL_FOLDER, LOGGING_CONFIG,
    POOL_STATS_DIR, PROCESS_RC_FILE, SERVER_SITE, SIMULATOR_POOL_STATS, STARTUP_FOLDER,
};
use flsim_observe::LoggerConfig;

use crate::{
    error::{SimError, SimResult},
    slot::ClientPaths,
};

/// Folders that survive [`cleanup_workspace`].
const PRESERVED: [&str; 2] = [STARTUP_FOLDER, LOCAL_FOLDER];

/// Wipe `root`, keeping its `startup` and `local` folders byte for byte.
///
/// Creates `root` if it does not exist yet.
pub fn cleanup_workspace(root: &Path) -> SimResult<()> {
    if !root.exists() {
        return fs::create_dir_all(root).map_err(|e| SimError::io(root, e));
    }

    let stash = tempfile::tempdir().map_err(|e| SimError::io(std::env::temp_dir(), e))?;
    for name in PRESERVED {
        let src = root.join(name);
        if src.is_dir() {
            copy_tree(&src, &stash.path().join(name))?;
        }
    }

    fs::remove_dir_all(root).map_err(|e| SimError::io(root, e))?;
    fs::create_dir_all(root).map_err(|e| SimError::io(root, e))?;

    for name in PRESERVED {
        let kept = stash.path().join(name);
        if kept.is_dir() {
            copy_tree(&kept, &root.join(name))?;
        }
    }
    debug!(target: "flsim.core.workspace", root = %root.display(), "workspace cleaned");
    Ok(())
}

/// Recursively copy `src` into `dst`, creating `dst` and overwriting files.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> SimResult<()> {
    fs::create_dir_all(dst).map_err(|e| SimError::io(dst, e))?;
    let entries = fs::read_dir(src).map_err(|e| SimError::io(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| SimError::io(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let kind = entry.file_type().map_err(|e| SimError::io(&from, e))?;
        if kind.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|e| SimError::io(&from, e))?;
        }
    }
    Ok(())
}

/// Path arithmetic for one simulator root.
#[derive(Debug, Clone)]
pub struct SiteLayout {
    root: PathBuf,
}

impl SiteLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn site_dir(&self, site: &str) -> PathBuf {
        self.root.join(site)
    }

    pub fn job_dir(&self, site: &str) -> PathBuf {
        self.site_dir(site).join(JOB_NAME)
    }

    pub fn app_root(&self, site: &str) -> PathBuf {
        self.job_dir(site).join(format!("app_{site}"))
    }

    pub fn config_dir(&self, site: &str) -> PathBuf {
        self.app_root(site).join(CONFIG_FOLDER)
    }

    pub fn custom_dir(&self, site: &str) -> PathBuf {
        self.app_root(site).join(CUSTOM_FOLDER)
    }

    pub fn meta_file(&self, site: &str) -> PathBuf {
        self.job_dir(site).join(JOB_META_FILE)
    }

    pub fn local_dir(&self, site: &str) -> PathBuf {
        self.site_dir(site).join(LOCAL_FOLDER)
    }

    pub fn startup_dir(&self, site: &str) -> PathBuf {
        self.site_dir(site).join(STARTUP_FOLDER)
    }

    pub fn logging_config(&self, site: &str) -> PathBuf {
        self.local_dir(site).join(LOGGING_CONFIG)
    }

    pub fn stats_file(&self) -> PathBuf {
        self.site_dir(SERVER_SITE)
            .join(POOL_STATS_DIR)
            .join(SIMULATOR_POOL_STATS)
    }

    pub fn rc_file(&self) -> PathBuf {
        self.root.join(PROCESS_RC_FILE)
    }

    pub fn client_paths(&self, site: &str) -> ClientPaths {
        ClientPaths {
            workspace: self.site_dir(site),
            app_root: self.app_root(site),
            custom_dir: self.custom_dir(site),
            logging_config: self.logging_config(site),
        }
    }

    /// Create `<site>/local` and `<site>/startup`, write the logger config and
    /// copy the workspace-level `local`/`startup` trees into them.
    pub fn prepare_site(&self, site: &str, logger: &LoggerConfig) -> SimResult<()> {
        let local = self.local_dir(site);
        let startup = self.startup_dir(site);
        fs::create_dir_all(&local).map_err(|e| SimError::io(&local, e))?;
        fs::create_dir_all(&startup).map_err(|e| SimError::io(&startup, e))?;

        let shared_local = self.root.join(LOCAL_FOLDER);
        if shared_local.is_dir() {
            copy_tree(&shared_local, &local)?;
        }
        let shared_startup = self.root.join(STARTUP_FOLDER);
        if shared_startup.is_dir() {
            copy_tree(&shared_startup, &startup)?;
        }

        logger.save(&self.logging_config(site))?;
        Ok(())
    }
}
