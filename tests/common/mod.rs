//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use gencheck::adapters::{
    CommentReceipt, GenerationError, Generator, MemoryObjectStore, PassthroughRevisions,
    ReviewCommenter,
};
use gencheck::config::ResolvedConfig;
use gencheck::core::{GenerationOptions, Orchestrator, Pipeline};
use gencheck::domain::{DirectoryTree, JobSpec};

/// Generator returning a fixed tree per revision; unknown revisions fail
#[derive(Default)]
pub struct ScriptedGenerator {
    trees: HashMap<String, DirectoryTree>,
    pub calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, revision: &str, files: &[(&str, &str)]) -> Self {
        let mut tree = DirectoryTree::new();
        for (path, contents) in files {
            tree.insert(path, 0o644, *contents).unwrap();
        }
        self.trees.insert(revision.to_string(), tree);
        self
    }

    pub fn with_tree(mut self, revision: &str, tree: DirectoryTree) -> Self {
        self.trees.insert(revision.to_string(), tree);
        self
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        revision: &str,
        _options: &GenerationOptions,
        output_dir: &Path,
    ) -> Result<DirectoryTree, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let tree = self.trees.get(revision).ok_or_else(|| GenerationError::Exited {
            code: Some(1),
            stderr: format!("unknown revision {}", revision),
        })?;
        tree.write_to(output_dir)?;
        Ok(tree.clone())
    }
}

/// Commenter failing its first `failures` calls
pub struct FlakyCommenter {
    failures: usize,
    pub calls: AtomicUsize,
}

impl FlakyCommenter {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReviewCommenter for FlakyCommenter {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn post_comment(&self, thread_id: &str, _body: &str) -> Result<CommentReceipt> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            anyhow::bail!("review platform unavailable");
        }
        Ok(CommentReceipt::new(thread_id, Some(format!("c{}", call))))
    }
}

pub fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

/// Pipeline with the given jobs and default limits
pub fn pipeline(jobs: Vec<JobSpec>) -> Pipeline {
    let mut pipeline =
        Pipeline::from_yaml("name: test\ngenerator:\n  command: [unused]\njobs: []\n").unwrap();
    pipeline.jobs = jobs;
    pipeline
}

pub fn orchestrator(
    home: &Path,
    pipeline: Pipeline,
    generator: ScriptedGenerator,
) -> (Orchestrator, Arc<MemoryObjectStore>) {
    let objects = Arc::new(MemoryObjectStore::new());
    let orchestrator = Orchestrator::new(
        ResolvedConfig::new(pipeline, home),
        Arc::new(generator),
        Arc::new(PassthroughRevisions),
        objects.clone(),
    );
    (orchestrator, objects)
}
