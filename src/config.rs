//! Configuration resolution.
//!
//! Configuration sources (highest priority first):
//! 1. `--config <file>` on the command line
//! 2. `.gencheck/pipeline.yaml` in the current directory or a parent
//!
//! The state directory comes from `GENCHECK_HOME`, then the pipeline's
//! `home:` key (relative to `.gencheck/`), then `~/.gencheck`.
//!
//! Every environment input the pipeline declares is read once, here. Nothing
//! downstream reads the process environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::pipeline::Pipeline;
use crate::domain::BuildId;

/// Directory searched for in the current directory and its parents
pub const CONFIG_DIR: &str = ".gencheck";

/// Pipeline file name inside `CONFIG_DIR`
pub const CONFIG_FILE: &str = "pipeline.yaml";

/// Environment variable overriding the state directory
pub const HOME_ENV: &str = "GENCHECK_HOME";

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory (ledgers, staging, job workspaces)
    pub home: PathBuf,

    /// Pipeline file the configuration came from (None when built in code)
    pub config_file: Option<PathBuf>,

    /// Validated pipeline definition
    pub pipeline: Pipeline,

    /// Root of the filesystem object store
    pub storage_root: PathBuf,

    /// Git repository used to resolve revisions, if configured
    pub repository: Option<PathBuf>,

    /// Environment inputs captured at resolution time
    pub environment: BTreeMap<String, String>,
}

impl ResolvedConfig {
    /// Configuration for an in-code pipeline rooted at `home`
    pub fn new(pipeline: Pipeline, home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            storage_root: home.join("objects"),
            home,
            config_file: None,
            pipeline,
            repository: None,
            environment: BTreeMap::new(),
        }
    }

    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    /// Per-build ledgers ($GENCHECK_HOME/builds)
    pub fn builds_dir(&self) -> PathBuf {
        self.home.join("builds")
    }

    /// Generator output for one build ($GENCHECK_HOME/staging/<build_id>)
    pub fn staging_dir(&self, build_id: &BuildId) -> PathBuf {
        self.home.join("staging").join(build_id.as_str())
    }

    /// Parent of job and diff workspaces ($GENCHECK_HOME/work)
    pub fn work_dir(&self) -> PathBuf {
        self.home.join("work")
    }

    /// A captured environment input
    pub fn env(&self, name: &str) -> Option<&str> {
        self.environment.get(name).map(String::as_str)
    }
}

/// Find the pipeline file by searching the current directory and parents
pub fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load configuration from the command line and the process environment
pub fn load(explicit: Option<&Path>) -> Result<ResolvedConfig> {
    let config_path = match explicit {
        Some(path) => path.to_path_buf(),
        None => find_config_file().with_context(|| {
            format!(
                "No pipeline file found (looked for {}/{} in this directory and its parents)",
                CONFIG_DIR, CONFIG_FILE
            )
        })?,
    };

    resolve(&config_path, |name| std::env::var(name).ok())
}

/// Resolve a pipeline file, reading environment inputs through `lookup`
pub fn resolve(
    config_path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    let pipeline = Pipeline::from_file(config_path)?;
    pipeline
        .validate()
        .with_context(|| format!("Invalid pipeline file: {}", config_path.display()))?;

    // `home:` is relative to the file's directory, other paths to the project root
    let config_dir = config_path.parent().unwrap_or(Path::new("."));
    let project_root = if config_dir.file_name().map_or(false, |n| n == CONFIG_DIR) {
        config_dir.parent().unwrap_or(Path::new("."))
    } else {
        config_dir
    };

    let home = if let Some(env_home) = lookup(HOME_ENV) {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = pipeline.home {
        resolve_path(config_dir, home_path)
    } else {
        dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(CONFIG_DIR)
    };

    let storage_root = match pipeline.storage.root {
        Some(ref root) => resolve_path(project_root, root),
        None => home.join("objects"),
    };

    let repository = pipeline
        .source
        .repository
        .as_deref()
        .map(|repo| resolve_path(project_root, repo));

    let environment = pipeline
        .environment_inputs()
        .into_iter()
        .filter_map(|name| lookup(&name).map(|value| (name, value)))
        .collect();

    Ok(ResolvedConfig {
        home,
        config_file: Some(config_path.to_path_buf()),
        pipeline,
        storage_root,
        repository,
        environment,
    })
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PIPELINE: &str = r#"
name: sdk
home: ./state
generator:
  command: [codegen, "{revision}", "{output}"]
storage:
  root: ./artifacts
source:
  repository: .
review:
  token_env: REVIEW_TOKEN
jobs:
  - name: compile
    command: [cargo, check]
  - name: integration
    command: [cargo, test]
    required_env: [AWS_ACCESS_KEY_ID]
"#;

    fn write_pipeline(root: &Path) -> PathBuf {
        let dir = root.join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        std::fs::write(&path, PIPELINE).unwrap();
        path
    }

    #[test]
    fn test_resolve_paths_and_environment() {
        let temp = TempDir::new().unwrap();
        let path = write_pipeline(temp.path());

        let env = BTreeMap::from([
            ("AWS_ACCESS_KEY_ID".to_string(), "AKIA".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ]);
        let config = resolve(&path, |name| env.get(name).cloned()).unwrap();

        assert_eq!(config.home, temp.path().join(CONFIG_DIR).join("./state"));
        assert_eq!(config.storage_root, temp.path().join("./artifacts"));
        assert_eq!(config.env("AWS_ACCESS_KEY_ID"), Some("AKIA"));
        assert_eq!(config.env("UNRELATED"), None);
        assert_eq!(config.env("REVIEW_TOKEN"), None);
        assert!(config.repository.is_some());
        assert_eq!(config.config_file.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_home_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        let path = write_pipeline(temp.path());

        let config = resolve(&path, |name| {
            (name == HOME_ENV).then(|| "/var/lib/gencheck".to_string())
        })
        .unwrap();
        assert_eq!(config.home, PathBuf::from("/var/lib/gencheck"));
    }

    #[test]
    fn test_invalid_pipeline_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pipeline.yaml");
        std::fs::write(&path, "name: sdk\ngenerator:\n  command: [g]\njobs: []\n").unwrap();

        assert!(resolve(&path, |_| None).is_err());
    }

    #[test]
    fn test_layout_helpers() {
        let pipeline = Pipeline::from_yaml(
            "name: p\ngenerator:\n  command: [g]\njobs:\n  - name: a\n    command: [\"true\"]\n",
        )
        .unwrap();
        let config = ResolvedConfig::new(pipeline, "/state");
        let id = BuildId::new("rev-abc-1").unwrap();

        assert_eq!(config.builds_dir(), PathBuf::from("/state/builds"));
        assert_eq!(config.staging_dir(&id), PathBuf::from("/state/staging/rev-abc-1"));
        assert_eq!(config.storage_root, PathBuf::from("/state/objects"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
