use super::{CommitRef, PushRequest, RepoRef, SourceHost, SourceHostError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub id: String,
    pub branch: String,
    pub message: String,
    pub forced: bool,
    pub allow_empty: bool,

    /// Snapshot of the pushed tree keyed by relative path.
    pub files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Repository {
    pub url: String,
    pub commits: Vec<Commit>,
}

/// A source host that keeps repositories in memory and records every push made to them.
#[derive(Debug, Default)]
pub struct Engine {
    repos: DashMap<String, Repository>,
    in_flight: Mutex<HashSet<String>>,
    push_delay: Option<Duration>,
    create_calls: AtomicU64,
    push_calls: AtomicU64,
    overlapping_pushes: AtomicU64,
    commit_counter: AtomicU64,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every push holds the repository for at least `delay`, which makes overlapping pushes
    /// observable.
    pub fn with_push_delay(delay: Duration) -> Self {
        Self {
            push_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn repository(&self, name: &str) -> Option<Repository> {
        self.repos.get(name).map(|entry| entry.value().clone())
    }

    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn push_calls(&self) -> u64 {
        self.push_calls.load(Ordering::SeqCst)
    }

    /// Number of pushes that started while another push to the same repository was running.
    pub fn overlapping_pushes(&self) -> u64 {
        self.overlapping_pushes.load(Ordering::SeqCst)
    }

    fn begin_push(&self, repo: &str) {
        let mut in_flight = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !in_flight.insert(repo.to_string()) {
            self.overlapping_pushes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn end_push(&self, repo: &str) {
        let mut in_flight = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        in_flight.remove(repo);
    }
}

#[async_trait]
impl SourceHost for Engine {
    async fn create_repo(&self, name: &str) -> Result<RepoRef, SourceHostError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let url = format!("memory://{name}");
        self.repos
            .entry(name.to_string())
            .or_insert_with(|| Repository {
                url: url.clone(),
                commits: vec![],
            });

        Ok(RepoRef {
            name: name.to_string(),
            url,
        })
    }

    async fn push(
        &self,
        repo: &RepoRef,
        tree: &Path,
        request: &PushRequest,
    ) -> Result<CommitRef, SourceHostError> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);

        if !self.repos.contains_key(&repo.name) {
            return Err(SourceHostError::Api(format!(
                "repository '{}' does not exist",
                repo.name
            )));
        }

        self.begin_push(&repo.name);

        let root = tree.to_path_buf();
        let snapshot = tokio::task::spawn_blocking(move || snapshot_tree(&root)).await;

        if let Some(delay) = self.push_delay {
            tokio::time::sleep(delay).await;
        }

        self.end_push(&repo.name);

        let files = snapshot
            .map_err(|e| SourceHostError::Io(e.to_string()))?
            .map_err(|e| SourceHostError::Io(e.to_string()))?;

        let id = format!(
            "{:040x}",
            self.commit_counter.fetch_add(1, Ordering::SeqCst) + 1
        );

        let commit = Commit {
            id: id.clone(),
            branch: request.branch.clone(),
            message: request.message.clone(),
            forced: request.force,
            allow_empty: request.allow_empty,
            files,
        };

        match self.repos.get_mut(&repo.name) {
            Some(mut entry) => {
                if request.force {
                    entry.commits.retain(|existing| existing.branch != request.branch);
                }
                entry.commits.push(commit);
            }
            None => {
                return Err(SourceHostError::Api(format!(
                    "repository '{}' disappeared mid push",
                    repo.name
                )))
            }
        }

        Ok(CommitRef { id })
    }
}

fn snapshot_tree(root: &Path) -> std::io::Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();

            if entry.file_name() == ".git" {
                continue;
            }

            if entry.file_type()?.is_dir() {
                pending.push(path);
                continue;
            }

            let relative = path
                .strip_prefix(root)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
                .to_string_lossy()
                .replace('\\', "/");

            files.insert(relative, std::fs::read(&path)?);
        }
    }

    Ok(files)
}
