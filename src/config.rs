//! The fuzzing session configuration, loaded from a JSON file.
//!
//! The config names the instrumented target, its argument list and the
//! directories the session works with. `target_args` may contain the literal
//! token `@@`, in which case the scratch input path is substituted for it and
//! the target reads the test case from that file; without `@@` the test case
//! is fed to the target over stdin.

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use libafl_bolts::Error;
use serde::Deserialize;

/// Default per-execution timeout in milliseconds.
const DEFAULT_TIMEOUT_MS: u64 = 1200;

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Everything a fuzzing session needs to know, as read from the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The instrumented binary to fuzz.
    pub target: PathBuf,
    /// Arguments passed to the target. A literal `@@` is replaced with the
    /// path of `current_input`.
    #[serde(default)]
    pub target_args: Vec<String>,
    /// The initial, read-only seed corpus.
    pub seeds_folder: PathBuf,
    /// Where the grown corpus lives. Created at startup; must not pre-exist.
    pub queue_folder: PathBuf,
    /// Where crashing inputs are saved.
    pub crashes_folder: PathBuf,
    /// Scratch file the target reads each test case from.
    pub current_input: PathBuf,
    /// Timeout for a single execution, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// If set, the target keeps its stdout/stderr instead of the null device.
    #[serde(default)]
    pub debug_child: bool,
}

impl Config {
    /// Loads and validates a config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw).map_err(|err| {
            Error::illegal_argument(format!(
                "config file {} is not valid: {err}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        let target_meta = fs::metadata(&self.target).map_err(|err| {
            Error::illegal_argument(format!(
                "target {} is not accessible: {err}",
                self.target.display()
            ))
        })?;
        if !target_meta.is_file() || target_meta.permissions().mode() & 0o111 == 0 {
            return Err(Error::illegal_argument(format!(
                "target {} is not an executable file",
                self.target.display()
            )));
        }

        if !self.seeds_folder.is_dir() {
            return Err(Error::illegal_argument(format!(
                "seeds folder {} is not a directory",
                self.seeds_folder.display()
            )));
        }

        // The seed corpus is copied here at startup, so a leftover queue from
        // an earlier session would corrupt the numeric naming scheme.
        if self.queue_folder.exists() {
            return Err(Error::illegal_argument(format!(
                "queue folder {} already exists, remove it or pick a fresh path",
                self.queue_folder.display()
            )));
        }

        if self.timeout_ms == 0 {
            return Err(Error::illegal_argument(
                "timeout_ms must be greater than zero",
            ));
        }

        Ok(())
    }

    /// Whether the target takes the test case over stdin rather than as a
    /// file argument.
    pub fn use_stdin(&self) -> bool {
        !self.target_args.iter().any(|arg| arg == "@@")
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write_executable(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn write_config_json(dir: &Path, target: &Path, queue: &Path) -> PathBuf {
        let seeds = dir.join("seeds");
        fs::create_dir(&seeds).unwrap();
        fs::write(seeds.join("a"), b"A").unwrap();
        let config = serde_json::json!({
            "target": target,
            "target_args": ["@@"],
            "seeds_folder": seeds,
            "queue_folder": queue,
            "crashes_folder": dir.join("crashes"),
            "current_input": dir.join(".cur_input"),
        });
        let path = dir.join("config.json");
        fs::write(&path, config.to_string()).unwrap();
        path
    }

    #[test]
    fn loads_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_executable(dir.path(), "target");
        let path = write_config_json(dir.path(), &target, &dir.path().join("queue"));

        let config = Config::load(&path).unwrap();
        assert_eq!(config.target, target);
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert!(!config.use_stdin());
    }

    #[test]
    fn rejects_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"target": "/bin/true"}"#).unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn rejects_non_executable_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::write(&target, b"").unwrap();
        let mut perms = fs::metadata(&target).unwrap().permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&target, perms).unwrap();
        let path = write_config_json(dir.path(), &target, &dir.path().join("queue"));
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn rejects_existing_queue_folder() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_executable(dir.path(), "target");
        let queue = dir.path().join("queue");
        fs::create_dir(&queue).unwrap();
        let path = write_config_json(dir.path(), &target, &queue);
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn stdin_mode_without_file_token() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_executable(dir.path(), "target");
        let seeds = dir.path().join("seeds");
        fs::create_dir(&seeds).unwrap();
        fs::write(seeds.join("a"), b"A").unwrap();
        let config = serde_json::json!({
            "target": target,
            "target_args": ["-q"],
            "seeds_folder": seeds,
            "queue_folder": dir.path().join("queue"),
            "crashes_folder": dir.path().join("crashes"),
            "current_input": dir.path().join(".cur_input"),
            "timeout_ms": 500,
        });
        let path = dir.path().join("config.json");
        fs::write(&path, config.to_string()).unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.use_stdin());
        assert_eq!(config.timeout_ms, 500);
    }
}
