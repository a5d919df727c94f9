//! Run configuration, resolved once at startup

use std::path::PathBuf;

/// Cluster name override, also exported to the provisioning tool
pub const CLUSTER_ENV: &str = "CLUSTER";
/// Cluster name variable read by terraform
pub const CLUSTER_NAME_ENV: &str = "TF_VAR_tectonic_cluster_name";
/// Admin email override
pub const ADMIN_EMAIL_ENV: &str = "TF_VAR_tectonic_admin_email";
/// Admin password override
pub const ADMIN_PASSWORD_ENV: &str = "TF_VAR_tectonic_admin_password";
/// License file path (required)
pub const LICENSE_PATH_ENV: &str = "TF_VAR_tectonic_license_path";
/// Pull secret file path (required)
pub const PULL_SECRET_PATH_ENV: &str = "TF_VAR_tectonic_pull_secret_path";
/// Presence keeps the cluster running after the run
pub const SKIP_CLEANUP_ENV: &str = "TECTONIC_TESTS_DONT_CLEAN_UP";
/// Presence marks a CI run
pub const CI_ENV: &str = "JENKINS_HOME";
/// Target platform
pub const PLATFORM_ENV: &str = "PLATFORM";
/// Variables file describing the cluster shape
pub const TF_VARS_FILE_ENV: &str = "TF_VARS_FILE";

/// Everything the lifecycle needs from the environment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Installer repository root, where `make` runs
    pub repo_root: PathBuf,
    /// Fixed cluster name
    pub cluster_name: Option<String>,
    /// Fixed admin email
    pub admin_email: Option<String>,
    /// Fixed admin password
    pub admin_password: Option<String>,
    /// License file path
    pub license_path: Option<PathBuf>,
    /// Pull secret file path
    pub pull_secret_path: Option<PathBuf>,
    /// Leave the cluster up after the run
    pub skip_cleanup: bool,
    /// Running under CI; build artifacts are cleaned after destroy
    pub ci: bool,
    /// Target platform
    pub platform: Option<String>,
}

impl LifecycleConfig {
    /// Names of required inputs that are not set
    pub fn missing_prerequisites(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if is_unset(&self.license_path) {
            missing.push(LICENSE_PATH_ENV.to_string());
        }
        if is_unset(&self.pull_secret_path) {
            missing.push(PULL_SECRET_PATH_ENV.to_string());
        }
        missing
    }
}

fn is_unset(path: &Option<PathBuf>) -> bool {
    path.as_ref().map_or(true, |p| p.as_os_str().is_empty())
}
