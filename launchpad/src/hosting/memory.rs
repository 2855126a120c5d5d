use super::{BuildConfig, Hosting, HostingError, ProjectRef};
use crate::source_host::RepoRef;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Projects are served from `https://<name>.<domain_suffix>`.
    pub domain_suffix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain_suffix: "pages.dev".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub reference: ProjectRef,
    pub repo: RepoRef,
    pub build: BuildConfig,
    pub domains: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Engine {
    domain_suffix: String,
    projects: DashMap<String, Project>,
    create_calls: AtomicU64,
    projects_created: AtomicU64,
    attach_calls: AtomicU64,
}

impl Engine {
    pub fn new(config: &Config) -> Self {
        Self {
            domain_suffix: config.domain_suffix.clone(),
            ..Default::default()
        }
    }

    pub fn project(&self, name: &str) -> Option<Project> {
        self.projects.get(name).map(|entry| entry.value().clone())
    }

    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// How many of the create calls actually made a new project.
    pub fn projects_created(&self) -> u64 {
        self.projects_created.load(Ordering::SeqCst)
    }

    pub fn attach_calls(&self) -> u64 {
        self.attach_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Hosting for Engine {
    async fn create_project(
        &self,
        name: &str,
        repo: &RepoRef,
        build: &BuildConfig,
    ) -> Result<ProjectRef, HostingError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let project = self.projects.entry(name.to_string()).or_insert_with(|| {
            self.projects_created.fetch_add(1, Ordering::SeqCst);
            Project {
                reference: ProjectRef {
                    name: name.to_string(),
                    url: format!("https://{name}.{}", self.domain_suffix),
                },
                repo: repo.clone(),
                build: build.clone(),
                domains: vec![],
            }
        });

        Ok(project.reference.clone())
    }

    async fn attach_domain(&self, project: &ProjectRef, domain: &str) -> Result<(), HostingError> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);

        let mut entry = self
            .projects
            .get_mut(&project.name)
            .ok_or_else(|| HostingError::ProjectNotFound(project.name.clone()))?;

        let domain = domain.to_lowercase();
        if !entry.domains.contains(&domain) {
            entry.domains.push(domain);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> RepoRef {
        RepoRef {
            name: "site-4f1c2a9e".into(),
            url: "memory://site-4f1c2a9e".into(),
        }
    }

    #[tokio::test]
    async fn create_project_is_lookup_or_create() {
        let hosting = Engine::new(&Config::default());

        let first = hosting
            .create_project("site-4f1c2a9e", &repo(), &BuildConfig::default())
            .await
            .expect("Failed to create project");
        let second = hosting
            .create_project("site-4f1c2a9e", &repo(), &BuildConfig::default())
            .await
            .expect("Failed to create project");

        assert_eq!(first, second);
        assert_eq!(first.url, "https://site-4f1c2a9e.pages.dev");
        assert_eq!(hosting.create_calls(), 2);
        assert_eq!(hosting.projects_created(), 1);
    }

    #[tokio::test]
    async fn attach_domain_once() {
        let hosting = Engine::new(&Config::default());
        let project = hosting
            .create_project("site-4f1c2a9e", &repo(), &BuildConfig::default())
            .await
            .expect("Failed to create project");

        for _ in 0..2 {
            hosting
                .attach_domain(&project, "Joes-Pizza.com")
                .await
                .expect("Failed to attach domain");
        }

        let stored = hosting.project("site-4f1c2a9e").expect("project should exist");
        assert_eq!(stored.domains, vec!["joes-pizza.com".to_string()]);

        let missing = hosting
            .attach_domain(
                &ProjectRef {
                    name: "ghost".into(),
                    url: String::new(),
                },
                "joes-pizza.com",
            )
            .await
            .unwrap_err();
        assert_eq!(missing, HostingError::ProjectNotFound("ghost".into()));
    }
}
