//! S3 source checking
//!
//! Lists the bucket under the configured prefix and fingerprints the
//! listing: each object contributes its normalized ETag, and the combined
//! digest hashes `(key, eTag)` pairs in key order. Multi-part-upload ETags
//! are treated as opaque identifiers; equality is all that matters.

use std::collections::BTreeMap;

use aws_sdk_s3::config::{Credentials, Region};
use rag_common::{RagError, Result};
use tracing::debug;

use super::{SecretData, SourceScan};
use crate::crd::SourceMetadata;
use crate::source::diff::digest_sorted;

/// Parse an S3 URI of the form `s3://bucket[/prefix]` into (bucket, prefix).
pub fn parse_s3_uri(uri: &str) -> Result<(String, String)> {
    let rest = uri
        .strip_prefix("s3://")
        .ok_or_else(|| RagError::InvalidUri(uri.to_string()))?;
    let (bucket, prefix) = match rest.split_once('/') {
        Some((bucket, prefix)) => (bucket, prefix),
        None => (rest, ""),
    };
    if bucket.is_empty() {
        return Err(RagError::InvalidUri(uri.to_string()));
    }
    Ok((bucket.to_string(), prefix.to_string()))
}

/// List the bucket and build the source fingerprint.
pub async fn check(uri: &str, secret: &SecretData) -> Result<SourceScan> {
    let (bucket, prefix) = parse_s3_uri(uri)?;
    let client = build_client(secret).await;

    let mut file_hashes = BTreeMap::new();
    let mut total_size: i64 = 0;
    let mut continuation_token: Option<String> = None;

    loop {
        let mut request = client.list_objects_v2().bucket(&bucket).prefix(&prefix);
        if let Some(token) = &continuation_token {
            request = request.continuation_token(token);
        }

        let page = request.send().await.map_err(|e| {
            RagError::S3(format!("failed to list s3://{}/{}: {}", bucket, prefix, e))
        })?;

        for object in page.contents() {
            let key = object.key().unwrap_or_default();
            // Skip directory placeholder keys
            if key.is_empty() || key.ends_with('/') {
                continue;
            }
            let etag = object
                .e_tag()
                .unwrap_or_default()
                .trim_matches('"')
                .to_string();
            total_size += object.size().unwrap_or(0);
            file_hashes.insert(key.to_string(), etag);
        }

        match page.next_continuation_token() {
            Some(token) => continuation_token = Some(token.to_string()),
            None => break,
        }
    }

    let file_count = file_hashes.len() as u32;
    debug!(bucket = %bucket, prefix = %prefix, file_count, "listed S3 source");

    let hash = digest_sorted(&file_hashes);
    Ok(SourceScan {
        hash,
        metadata: SourceMetadata {
            file_count,
            total_size,
            file_hashes,
            ..Default::default()
        },
        file_hint: file_count,
    })
}

/// Build an S3 client, preferring static credentials from the referenced
/// secret over the ambient environment.
async fn build_client(secret: &SecretData) -> aws_sdk_s3::Client {
    let mut loader = aws_config::from_env();

    let access_key = secret.get("AWS_ACCESS_KEY_ID");
    let secret_key = secret.get("AWS_SECRET_ACCESS_KEY");
    if let (Some(access_key), Some(secret_key)) = (access_key, secret_key) {
        loader = loader.credentials_provider(Credentials::new(
            access_key.clone(),
            secret_key.clone(),
            None,
            None,
            "documentset-source-secret",
        ));
    }
    if let Some(region) = secret.get("AWS_REGION") {
        loader = loader.region(Region::new(region.clone()));
    }

    let config = loader.load().await;
    aws_sdk_s3::Client::new(&config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bucket_and_prefix() {
        assert_eq!(
            parse_s3_uri("s3://docs/corpus/").unwrap(),
            ("docs".to_string(), "corpus/".to_string())
        );
        assert_eq!(
            parse_s3_uri("s3://docs/a/b/c").unwrap(),
            ("docs".to_string(), "a/b/c".to_string())
        );
    }

    #[test]
    fn test_parse_bucket_only() {
        assert_eq!(parse_s3_uri("s3://docs").unwrap(), ("docs".to_string(), String::new()));
    }

    #[test]
    fn test_parse_rejects_bad_uris() {
        assert!(parse_s3_uri("http://docs/corpus").is_err());
        assert!(parse_s3_uri("s3://").is_err());
        assert!(parse_s3_uri("docs/corpus").is_err());
    }
}
