//! Subprocess adapter for the external code generator.
//!
//! Spawns the configured command with placeholders expanded, waits for it
//! under a timeout, and reads the produced directory back into memory.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::core::pipeline::{GenerationOptions, GeneratorConfig};
use crate::domain::{DirectoryTree, TreeError};

use super::Generator;

/// Bytes of generator stderr kept in errors
const STDERR_TAIL_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Failed to spawn generator '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Generator exited with code {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    #[error("Generator timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Generator produced no output tree")]
    EmptyOutput,

    #[error("Failed to read generated tree: {0}")]
    Tree(#[from] TreeError),

    #[error("Failed to resolve revision '{revision}': {cause}")]
    Revision { revision: String, cause: String },

    #[error("Generator IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Code generator run as a child process
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    timeout: Duration,
}

impl CommandGenerator {
    /// Create from an argv-style command. Returns `None` for an empty command.
    pub fn new(command: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: BTreeMap::new(),
            timeout,
        })
    }

    pub fn from_config(config: &GeneratorConfig) -> Option<Self> {
        let mut generator = Self::new(&config.command, config.timeout())?;
        generator.env = config.env.clone();
        Some(generator)
    }

    /// Substitute placeholders in one argument
    fn expand(arg: &str, revision: &str, options: &GenerationOptions, output_dir: &Path) -> String {
        arg.replace("{revision}", revision)
            .replace("{output}", &output_dir.to_string_lossy())
            .replace("{modules}", &options.modules.join(","))
            .replace("{features}", &options.features.join(","))
    }

    async fn execute_subprocess(
        &self,
        revision: &str,
        options: &GenerationOptions,
        output_dir: &Path,
    ) -> Result<(), GenerationError> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| Self::expand(a, revision, options, output_dir))
            .collect();

        debug!(program = %self.program, ?args, "Spawning generator");

        let child = Command::new(&self.program)
            .args(&args)
            .envs(&self.env)
            .env("GENCHECK_REVISION", revision)
            .env("GENCHECK_OUTPUT", output_dir)
            .env("GENCHECK_MODULES", options.modules.join(","))
            .env("GENCHECK_FEATURES", options.features.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| GenerationError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Dropping the child on timeout kills it
        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| GenerationError::TimedOut(self.timeout))??;

        if !output.status.success() {
            let stderr = &output.stderr;
            let tail = &stderr[stderr.len().saturating_sub(STDERR_TAIL_BYTES)..];
            return Err(GenerationError::Exited {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(tail).trim().to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    fn name(&self) -> &str {
        &self.program
    }

    async fn generate(
        &self,
        revision: &str,
        options: &GenerationOptions,
        output_dir: &Path,
    ) -> Result<DirectoryTree, GenerationError> {
        tokio::fs::create_dir_all(output_dir).await?;

        self.execute_subprocess(revision, options, output_dir).await?;

        let dir = output_dir.to_path_buf();
        let tree = tokio::task::spawn_blocking(move || DirectoryTree::from_dir(&dir))
            .await
            .map_err(|e| GenerationError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        if tree.is_empty() {
            return Err(GenerationError::EmptyOutput);
        }

        info!(revision, files = tree.len(), bytes = tree.total_bytes(), "Generation completed");
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_placeholder_expansion() {
        let options = GenerationOptions {
            modules: vec!["s3".into(), "sts".into()],
            features: vec![],
        };
        let expanded = CommandGenerator::expand(
            "--rev={revision} --out={output} --modules={modules}",
            "abc",
            &options,
            Path::new("/tmp/out"),
        );
        assert_eq!(expanded, "--rev=abc --out=/tmp/out --modules=s3,sts");
    }

    #[test]
    fn test_empty_command() {
        assert!(CommandGenerator::new(&[], Duration::from_secs(1)).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_generates_tree() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out");
        let generator = CommandGenerator::new(
            &sh("mkdir -p \"$GENCHECK_OUTPUT/src\" && echo \"$GENCHECK_REVISION\" > \"$GENCHECK_OUTPUT/src/rev.txt\""),
            Duration::from_secs(10),
        )
        .unwrap();

        let tree = generator
            .generate("abc123", &GenerationOptions::default(), &out)
            .await
            .unwrap();

        assert_eq!(tree.get("src/rev.txt").unwrap().contents, b"abc123\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit() {
        let temp = TempDir::new().unwrap();
        let generator =
            CommandGenerator::new(&sh("echo boom >&2; exit 3"), Duration::from_secs(10)).unwrap();

        let err = generator
            .generate("abc", &GenerationOptions::default(), temp.path())
            .await
            .unwrap_err();

        match err {
            GenerationError::Exited { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_output_is_an_error() {
        let temp = TempDir::new().unwrap();
        let generator = CommandGenerator::new(&sh("true"), Duration::from_secs(10)).unwrap();

        let err = generator
            .generate("abc", &GenerationOptions::default(), temp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::EmptyOutput));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout() {
        let temp = TempDir::new().unwrap();
        let generator =
            CommandGenerator::new(&sh("sleep 5"), Duration::from_millis(200)).unwrap();

        let err = generator
            .generate("abc", &GenerationOptions::default(), temp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::TimedOut(_)));
    }
}
