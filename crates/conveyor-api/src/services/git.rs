//! Branch head lookup through `git ls-remote`.

use async_trait::async_trait;
use conveyor_core::{Error, Result};
use conveyor_trigger::RemoteHeads;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

pub struct GitRemoteHeads {
    git_bin: String,
}

impl Default for GitRemoteHeads {
    fn default() -> Self {
        Self::new()
    }
}

impl GitRemoteHeads {
    pub fn new() -> Self {
        Self {
            git_bin: "git".to_string(),
        }
    }
}

#[async_trait]
impl RemoteHeads for GitRemoteHeads {
    async fn head(&self, repository: &str, branch: &str) -> Result<String> {
        let url = remote_url(repository);
        let reference = format!("refs/heads/{}", branch);
        debug!(url = %url, reference = %reference, "Resolving remote head");

        let output = Command::new(&self.git_bin)
            .args(["ls-remote", &url, &reference])
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Execution(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Execution(format!(
                "git ls-remote failed for {}: {}",
                repository,
                stderr.trim()
            )));
        }

        parse_ls_remote(&String::from_utf8_lossy(&output.stdout), &reference)
            .ok_or_else(|| Error::NotFound(format!("branch {} in {}", branch, repository)))
    }
}

/// Turn a configured repository into something `git` can fetch. Bare
/// `host/org/repo` identities get an https scheme.
fn remote_url(repository: &str) -> String {
    let looks_scp = repository.contains('@') && repository.contains(':');
    if repository.contains("://") || looks_scp || repository.starts_with('/') {
        repository.to_string()
    } else {
        format!("https://{}", repository)
    }
}

fn parse_ls_remote(output: &str, reference: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (sha, name) = line.split_once(char::is_whitespace)?;
        (name.trim() == reference && !sha.is_empty()).then(|| sha.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ls_remote() {
        let output = "\
3f2a1b0c\trefs/heads/main-old
9e8d7c6b\trefs/heads/main
";
        assert_eq!(
            parse_ls_remote(output, "refs/heads/main").as_deref(),
            Some("9e8d7c6b")
        );
        assert_eq!(parse_ls_remote("", "refs/heads/main"), None);
    }

    #[test]
    fn test_remote_url() {
        assert_eq!(remote_url("github.com/org/api"), "https://github.com/org/api");
        assert_eq!(
            remote_url("https://github.com/org/api.git"),
            "https://github.com/org/api.git"
        );
        assert_eq!(remote_url("git@github.com:org/api.git"), "git@github.com:org/api.git");
        assert_eq!(remote_url("/srv/git/api"), "/srv/git/api");
    }
}
