//! Configuration for arcindex paths and workflow defaults.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (ARCINDEX_HOME, ARCINDEX_RUNS, ARCINDEX_STATE)
//! 2. Config file (.arcindex/config.yaml)
//! 3. Defaults (~/.arcindex)
//!
//! Config file discovery:
//! - Searches current directory and parents for .arcindex/config.yaml
//! - `home` is relative to the .arcindex/ directory; other paths are
//!   relative to the project root (the parent of .arcindex/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

pub const DEFAULT_WORKFLOW: &str = "greenfield-discovery";
pub const DEFAULT_OPERATION_MODE: &str = "interactive";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub workflow: Option<WorkflowConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine home directory (relative to .arcindex/)
    pub home: Option<String>,
    /// Run directories (relative to project root)
    pub runs: Option<String>,
    /// Workflow state directories (relative to project root)
    pub state: Option<String>,
    /// Workflow template JSON (relative to project root)
    pub workflow_template: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowConfig {
    pub default_workflow: Option<String>,
    pub operation_mode: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to arcindex home
    pub home: PathBuf,
    /// Parent of every `runs/<run_id>/` directory
    pub runs_root: PathBuf,
    /// Parent of every `<workflow_id>/workflow.json`
    pub state_root: PathBuf,
    /// Template override; the built-in template is used when absent
    pub workflow_template: Option<PathBuf>,
    /// Workflow type recorded for new workflows
    pub default_workflow: String,
    pub operation_mode: String,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".arcindex").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's location
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

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".arcindex");

    resolve_config(find_config_file(), default_home, |key| std::env::var(key).ok())
}

/// Combine an optional config file, the default home, and environment
/// lookups into a resolved configuration
fn resolve_config<F>(
    config_file: Option<PathBuf>,
    default_home: PathBuf,
    env: F,
) -> Result<ResolvedConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let config = config_file.as_deref().map(load_config_file).transpose()?;

    // .arcindex/ and the project root above it
    let arcindex_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));
    let base_dir = arcindex_dir.parent().unwrap_or(Path::new("."));

    let paths = config.as_ref().map(|c| c.paths.clone()).unwrap_or_default();
    let workflow = config
        .as_ref()
        .and_then(|c| c.workflow.clone())
        .unwrap_or_default();

    let home = if let Some(env_home) = env("ARCINDEX_HOME") {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = paths.home {
        resolve_path(arcindex_dir, home_path)
    } else {
        default_home
    };

    let runs_root = if let Some(env_runs) = env("ARCINDEX_RUNS") {
        PathBuf::from(env_runs)
    } else if let Some(ref runs_path) = paths.runs {
        resolve_path(base_dir, runs_path)
    } else {
        home.join("runs")
    };

    let state_root = if let Some(env_state) = env("ARCINDEX_STATE") {
        PathBuf::from(env_state)
    } else if let Some(ref state_path) = paths.state {
        resolve_path(base_dir, state_path)
    } else {
        home.join("state")
    };

    let workflow_template = paths
        .workflow_template
        .as_deref()
        .map(|template| resolve_path(base_dir, template));

    Ok(ResolvedConfig {
        home,
        runs_root,
        state_root,
        workflow_template,
        default_workflow: workflow
            .default_workflow
            .unwrap_or_else(|| DEFAULT_WORKFLOW.to_string()),
        operation_mode: workflow
            .operation_mode
            .unwrap_or_else(|| DEFAULT_OPERATION_MODE.to_string()),
        config_file,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the runs directory (default $ARCINDEX_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.runs_root.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(temp: &TempDir, body: &str) -> PathBuf {
        let arcindex_dir = temp.path().join(".arcindex");
        std::fs::create_dir_all(&arcindex_dir).unwrap();
        let config_path = arcindex_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", body).unwrap();
        config_path
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve_config(None, PathBuf::from("/home/me/.arcindex"), no_env).unwrap();

        assert_eq!(config.home, PathBuf::from("/home/me/.arcindex"));
        assert_eq!(config.runs_root, PathBuf::from("/home/me/.arcindex/runs"));
        assert_eq!(config.state_root, PathBuf::from("/home/me/.arcindex/state"));
        assert_eq!(config.default_workflow, DEFAULT_WORKFLOW);
        assert_eq!(config.operation_mode, DEFAULT_OPERATION_MODE);
        assert!(config.workflow_template.is_none());
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
version: "1.0"
paths:
  home: ./
  runs: /srv/arcindex/runs
  workflow_template: templates/workflow.json
workflow:
  operation_mode: autonomous
"#,
        );

        let file = load_config_file(&config_path).unwrap();
        assert_eq!(file.version, "1.0");
        assert_eq!(file.paths.home, Some("./".to_string()));
        assert_eq!(
            file.workflow.unwrap().operation_mode,
            Some("autonomous".to_string())
        );

        let config = resolve_config(Some(config_path.clone()), PathBuf::from("/unused"), no_env).unwrap();
        let root = temp.path().canonicalize().unwrap();
        assert_eq!(config.home, root.join(".arcindex"));
        assert_eq!(config.runs_root, PathBuf::from("/srv/arcindex/runs"));
        assert_eq!(config.state_root, root.join(".arcindex").join("state"));
        assert_eq!(
            config.workflow_template,
            Some(temp.path().join("templates/workflow.json"))
        );
        assert_eq!(config.operation_mode, "autonomous");
        assert_eq!(config.default_workflow, DEFAULT_WORKFLOW);
        assert_eq!(config.config_file, Some(config_path));
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(&temp, "version: \"1.0\"\npaths:\n  state: ./state");
        let env: HashMap<&str, &str> = [
            ("ARCINDEX_HOME", "/env/home"),
            ("ARCINDEX_STATE", "/env/state"),
        ]
        .into_iter()
        .collect();

        let config = resolve_config(Some(config_path), PathBuf::from("/unused"), |key| {
            env.get(key).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(config.home, PathBuf::from("/env/home"));
        assert_eq!(config.runs_root, PathBuf::from("/env/home/runs"));
        assert_eq!(config.state_root, PathBuf::from("/env/state"));
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
