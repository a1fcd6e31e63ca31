//! Push events from Git providers and repository identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Branch assumed when a push carries no usable ref.
pub const DEFAULT_BRANCH: &str = "main";

/// Git provider that sent a push notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitProvider {
    /// Token-header authenticated provider.
    Gitlab,
    /// HMAC-signature authenticated provider.
    Github,
}

impl std::fmt::Display for GitProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitProvider::Gitlab => write!(f, "gitlab"),
            GitProvider::Github => write!(f, "github"),
        }
    }
}

impl std::str::FromStr for GitProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gitlab" => Ok(GitProvider::Gitlab),
            "github" => Ok(GitProvider::Github),
            _ => Err(format!("Unknown git provider: {}", s)),
        }
    }
}

/// Parsed push event data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub provider: GitProvider,
    pub r#ref: String,
    pub branch: String,
    pub tag: Option<String>,
    /// Head commit after the push.
    pub after: String,
    /// Repository URL as sent by the provider (not normalized).
    pub repository_url: String,
    pub commits: Vec<CommitInfo>,
    pub actor: String,
}

/// Commit information from a push event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub author_email: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl PushEvent {
    /// Parse a raw webhook body for the given provider.
    pub fn parse(provider: GitProvider, raw: &[u8]) -> Result<Self> {
        let payload: Value = serde_json::from_slice(raw)
            .map_err(|e| Error::Validation(format!("invalid JSON payload: {}", e)))?;

        match provider {
            GitProvider::Gitlab => Self::from_gitlab_payload(&payload),
            GitProvider::Github => Self::from_github_payload(&payload),
        }
    }

    /// Parse a GitHub push webhook payload
    pub fn from_github_payload(payload: &Value) -> Result<Self> {
        let r#ref = str_at(payload, &["ref"]).unwrap_or_default().to_string();
        let after = str_at(payload, &["after"])
            .ok_or_else(|| Error::Validation("missing field: after".to_string()))?
            .to_string();
        let repository_url = first_str(
            payload,
            &[
                &["repository", "clone_url"],
                &["repository", "html_url"],
                &["repository", "url"],
            ],
        )
        .ok_or_else(|| Error::Validation("missing field: repository url".to_string()))?
        .to_string();
        let actor = first_str(payload, &[&["pusher", "name"], &["sender", "login"]])
            .unwrap_or("unknown")
            .to_string();

        Ok(Self::assemble(
            GitProvider::Github,
            r#ref,
            after,
            repository_url,
            parse_commits(payload),
            actor,
        ))
    }

    /// Parse a GitLab push webhook payload
    pub fn from_gitlab_payload(payload: &Value) -> Result<Self> {
        let r#ref = str_at(payload, &["ref"]).unwrap_or_default().to_string();
        let after = first_str(payload, &[&["after"], &["checkout_sha"]])
            .ok_or_else(|| Error::Validation("missing field: after".to_string()))?
            .to_string();
        let repository_url = first_str(
            payload,
            &[
                &["repository", "git_http_url"],
                &["repository", "url"],
                &["repository", "homepage"],
                &["project", "git_http_url"],
                &["project", "web_url"],
            ],
        )
        .ok_or_else(|| Error::Validation("missing field: repository url".to_string()))?
        .to_string();
        let actor = first_str(payload, &[&["user_username"], &["user_name"]])
            .unwrap_or("unknown")
            .to_string();

        Ok(Self::assemble(
            GitProvider::Gitlab,
            r#ref,
            after,
            repository_url,
            parse_commits(payload),
            actor,
        ))
    }

    fn assemble(
        provider: GitProvider,
        r#ref: String,
        after: String,
        repository_url: String,
        commits: Vec<CommitInfo>,
        actor: String,
    ) -> Self {
        let tag = r#ref.strip_prefix("refs/tags/").map(str::to_string);
        PushEvent {
            provider,
            branch: branch_from_ref(&r#ref),
            r#ref,
            tag,
            after,
            repository_url,
            commits,
            actor,
        }
    }

    /// Normalized repository identity of this push.
    pub fn normalized_repository(&self) -> String {
        normalize_repo_url(&self.repository_url)
    }

    /// Key used by the commit dedup cache.
    pub fn dedup_key(&self) -> String {
        dedup_key(&self.repository_url, &self.after)
    }

    /// A push whose head is the null SHA deletes the branch.
    pub fn is_branch_deletion(&self) -> bool {
        !self.after.is_empty() && self.after.chars().all(|c| c == '0')
    }
}

impl CommitInfo {
    fn from_payload_commit(value: &Value) -> Option<Self> {
        Some(CommitInfo {
            sha: value.get("id")?.as_str()?.to_string(),
            message: value
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("")
                .to_string(),
            author: str_at(value, &["author", "name"])
                .unwrap_or("unknown")
                .to_string(),
            author_email: str_at(value, &["author", "email"]).unwrap_or("").to_string(),
            timestamp: value
                .get("timestamp")
                .and_then(|t| t.as_str())
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            added: string_list(value, "added"),
            modified: string_list(value, "modified"),
            removed: string_list(value, "removed"),
        })
    }
}

/// Extract the branch name from a ref: `refs/heads/X` becomes `X`.
/// An empty ref falls back to [`DEFAULT_BRANCH`].
pub fn branch_from_ref(r#ref: &str) -> String {
    let branch = r#ref.strip_prefix("refs/heads/").unwrap_or(r#ref).trim();
    if branch.is_empty() {
        DEFAULT_BRANCH.to_string()
    } else {
        branch.to_string()
    }
}

/// Normalize a repository URL to `host/path` form.
///
/// Strips the protocol, embedded credentials, a trailing `.git` and trailing
/// slashes, converts scp-style `git@host:org/repo` to `host/org/repo`, and
/// lowercases the result.
pub fn normalize_repo_url(url: &str) -> String {
    let lowered = url.trim().to_lowercase();
    let (rest, had_scheme) = match lowered.split_once("://") {
        Some((_, rest)) => (rest, true),
        None => (lowered.as_str(), false),
    };

    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, path),
        None => (rest, ""),
    };
    let host = authority
        .rsplit_once('@')
        .map(|(_, host)| host)
        .unwrap_or(authority);

    // `host:org` without a scheme is scp syntax, `host:8080` is a port.
    let host = match host.split_once(':') {
        Some((name, after)) if !had_scheme && !after.chars().all(|c| c.is_ascii_digit()) => {
            format!("{}/{}", name, after)
        }
        _ => host.to_string(),
    };

    let mut normalized = if path.is_empty() {
        host
    } else {
        format!("{}/{}", host, path)
    };

    loop {
        let trimmed = normalized.trim_end_matches('/');
        let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
        if trimmed.len() == normalized.len() {
            break;
        }
        normalized = trimmed.to_string();
    }
    normalized
}

/// Dedup key for a repository and commit: `normalize(url) + ":" + commit`.
pub fn dedup_key(repository_url: &str, commit: &str) -> String {
    format!("{}:{}", normalize_repo_url(repository_url), commit)
}

/// Dedup key recording that one job was admitted for a commit.
pub fn job_dedup_key(repository_url: &str, commit: &str, job_id: &str) -> String {
    format!("{}#{}", dedup_key(repository_url, commit), job_id)
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().filter(|s| !s.is_empty())
}

fn first_str<'a>(value: &'a Value, paths: &[&[&str]]) -> Option<&'a str> {
    paths.iter().find_map(|path| str_at(value, path))
}

fn parse_commits(payload: &Value) -> Vec<CommitInfo> {
    payload
        .get("commits")
        .and_then(|c| c.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(CommitInfo::from_payload_commit)
                .collect()
        })
        .unwrap_or_default()
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|a| a.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}
