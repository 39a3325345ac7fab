//! Git source checking
//!
//! Resolves the remote tip commit of the configured branch over the smart
//! HTTP transport: `GET <repo>/info/refs?service=git-upload-pack` returns a
//! pkt-line ref advertisement, and the advertised object id for
//! `refs/heads/<branch>` is the source digest. No clone, no working tree.

use rag_common::{RagError, Result};
use tracing::debug;

use super::{SecretData, SourceScan};
use crate::crd::SourceMetadata;

const DEFAULT_BRANCH: &str = "main";

/// Split a git URI of the form `<repo>[#<branch>]`.
pub fn parse_git_uri(uri: &str) -> (String, String) {
    match uri.split_once('#') {
        Some((repo, branch)) if !branch.is_empty() => (repo.to_string(), branch.to_string()),
        Some((repo, _)) => (repo.to_string(), DEFAULT_BRANCH.to_string()),
        None => (uri.to_string(), DEFAULT_BRANCH.to_string()),
    }
}

/// Look up the remote tip of the branch and build the source fingerprint.
pub async fn check(client: &reqwest::Client, uri: &str, secret: &SecretData) -> Result<SourceScan> {
    let (repo, branch) = parse_git_uri(uri);

    let refs_url = format!(
        "{}/info/refs?service=git-upload-pack",
        repo.trim_end_matches('/')
    );
    let mut request = client.get(&refs_url);
    if let Some(token) = secret.get("GIT_TOKEN") {
        request = request.bearer_auth(token);
    }

    let response = request
        .send()
        .await
        .map_err(|e| RagError::Git(format!("ref lookup for {} failed: {}", repo, e)))?;

    let status = response.status();
    if !status.is_success() {
        return Err(RagError::Git(format!(
            "ref lookup for {} returned status {}",
            repo,
            status.as_u16()
        )));
    }

    let body = response.bytes().await.map_err(RagError::internal)?;
    let advertisement = String::from_utf8_lossy(&body);

    let commit = resolve_branch_tip(&advertisement, &branch).ok_or_else(|| {
        RagError::Git(format!("branch '{}' not advertised by {}", branch, repo))
    })?;
    debug!(repo = %repo, branch = %branch, commit = %commit, "resolved git tip");

    Ok(SourceScan {
        hash: commit.clone(),
        metadata: SourceMetadata {
            git_branch: branch,
            git_commit_hash: commit,
            ..Default::default()
        },
        file_hint: 1,
    })
}

/// Find the advertised object id for `refs/heads/<branch>`, falling back to
/// the advertised `HEAD` when the branch itself is not listed.
fn resolve_branch_tip(advertisement: &str, branch: &str) -> Option<String> {
    let want = format!("refs/heads/{}", branch);
    let mut head: Option<String> = None;

    for line in pkt_lines(advertisement) {
        // The service comment precedes the ref list
        if line.starts_with('#') {
            continue;
        }
        // The first ref line carries "\0"-separated capabilities
        let line = line.split('\0').next().unwrap_or(&line);
        let Some((oid, refname)) = line.split_once(' ') else {
            continue;
        };
        if oid.len() != 40 || !oid.bytes().all(|b| b.is_ascii_hexdigit()) {
            continue;
        }
        if refname == want {
            return Some(oid.to_string());
        }
        if refname == "HEAD" {
            head = Some(oid.to_string());
        }
    }

    head
}

/// Decode pkt-line framing: each frame is a 4-hex-digit length (including
/// the length itself) followed by the payload; "0000" is a flush frame.
fn pkt_lines(data: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut rest = data;

    while rest.len() >= 4 {
        let Some(len_hex) = rest.get(..4) else { break };
        let Ok(len) = usize::from_str_radix(len_hex, 16) else { break };
        if len == 0 {
            let Some(next) = rest.get(4..) else { break };
            rest = next;
            continue;
        }
        if len < 4 || len > rest.len() {
            break;
        }
        if let Some(payload) = rest.get(4..len) {
            lines.push(payload.trim_end_matches('\n').to_string());
        }
        let Some(next) = rest.get(len..) else { break };
        rest = next;
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    const OID_MAIN: &str = "1111111111111111111111111111111111111111";
    const OID_DEV: &str = "2222222222222222222222222222222222222222";

    fn pkt(payload: &str) -> String {
        format!("{:04x}{}", payload.len() + 4, payload)
    }

    fn advertisement() -> String {
        let mut body = pkt("# service=git-upload-pack\n");
        body.push_str("0000");
        body.push_str(&pkt(&format!(
            "{} HEAD\0multi_ack symref=HEAD:refs/heads/main agent=git/2.43.0\n",
            OID_MAIN
        )));
        body.push_str(&pkt(&format!("{} refs/heads/main\n", OID_MAIN)));
        body.push_str(&pkt(&format!("{} refs/heads/dev\n", OID_DEV)));
        body.push_str("0000");
        body
    }

    #[test]
    fn test_parse_git_uri() {
        assert_eq!(
            parse_git_uri("https://example.com/repo.git#dev"),
            ("https://example.com/repo.git".to_string(), "dev".to_string())
        );
        assert_eq!(
            parse_git_uri("https://example.com/repo.git"),
            ("https://example.com/repo.git".to_string(), "main".to_string())
        );
        assert_eq!(
            parse_git_uri("https://example.com/repo.git#"),
            ("https://example.com/repo.git".to_string(), "main".to_string())
        );
    }

    #[test]
    fn test_resolve_named_branch() {
        let ad = advertisement();
        assert_eq!(resolve_branch_tip(&ad, "main").as_deref(), Some(OID_MAIN));
        assert_eq!(resolve_branch_tip(&ad, "dev").as_deref(), Some(OID_DEV));
    }

    #[test]
    fn test_resolve_falls_back_to_head() {
        let ad = advertisement();
        assert_eq!(resolve_branch_tip(&ad, "missing").as_deref(), Some(OID_MAIN));
    }

    #[test]
    fn test_resolve_rejects_garbage() {
        assert_eq!(resolve_branch_tip("not pkt lines at all", "main"), None);
        let ad = advertisement();
        assert_eq!(resolve_branch_tip(&ad[..10], "main"), None);
    }

    #[test]
    fn test_pkt_lines_skip_flush_frames() {
        let ad = advertisement();
        let lines = pkt_lines(&ad);
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("# service="));
    }
}
