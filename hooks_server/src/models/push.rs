//! Push webhook payload.

use serde::Deserialize;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PushError {
    #[error("invalid push payload: {0}")]
    Payload(String),
    #[error("cannot derive repository from url {0:?}")]
    RepositoryUrl(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub after: String,
    pub repository: PushRepository,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushRepository {
    pub url: String,
}

/// Owner and name of the pushed repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSlug {
    pub owner: String,
    pub name: String,
}

impl RepoSlug {
    pub fn ssh_url(&self) -> String {
        format!("git@github.com:{}/{}.git", self.owner, self.name)
    }
}

impl std::fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Whether `git_ref` names the head of `branch`.
pub fn is_branch_ref(git_ref: &str, branch: &str) -> bool {
    git_ref
        .strip_prefix("refs/heads/")
        .is_some_and(|b| b == branch)
}

impl PushEvent {
    pub fn from_slice(body: &[u8]) -> Result<Self, PushError> {
        serde_json::from_slice(body).map_err(|e| PushError::Payload(e.to_string()))
    }

    /// Whether the push targets `refs/heads/<branch>`.
    pub fn is_branch(&self, branch: &str) -> bool {
        is_branch_ref(&self.git_ref, branch)
    }

    /// Owner and name from the last two path segments of the repository url.
    pub fn slug(&self) -> Result<RepoSlug, PushError> {
        let mut segments = self
            .repository
            .url
            .trim_end_matches('/')
            .rsplit(['/', ':'])
            .filter(|s| !s.is_empty());

        let name = segments.next();
        let owner = segments.next();
        match (owner, name) {
            (Some(owner), Some(name)) => Ok(RepoSlug {
                owner: owner.to_string(),
                name: name.trim_end_matches(".git").to_string(),
            }),
            _ => Err(PushError::RepositoryUrl(self.repository.url.clone())),
        }
    }
}
