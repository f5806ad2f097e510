use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

const DIGEST_ALGORITHM: &str = "sha256";
const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseMetadata {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    /// Older assets carry `null` here.
    #[serde(default)]
    pub digest: Option<String>,
    pub browser_download_url: String,
}

/// What the applier needs out of a release: where to fetch it and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateTarget {
    pub asset_name: String,
    pub url: String,
    pub digest: ExpectedDigest,
}

/// Lower-case hex SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedDigest(String);

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("failed to fetch release info: {0}")]
    Network(#[source] reqwest::Error),
    #[error("unexpected status: {0}")]
    UnexpectedStatus(StatusCode),
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ReleaseMetadata {
    /// Only the first asset is consumed. Releases that publish several
    /// platform builds will resolve to whichever one comes first.
    pub fn target(&self) -> Result<UpdateTarget, ReleaseError> {
        let asset = self.assets.first().ok_or_else(|| {
            ReleaseError::Decode(format!("release {} has no assets", self.tag_name))
        })?;
        let digest = asset
            .digest
            .as_deref()
            .ok_or_else(|| "no digest published".to_string())
            .and_then(ExpectedDigest::parse)
            .map_err(|reason| ReleaseError::Decode(format!("asset {}: {reason}", asset.name)))?;
        Ok(UpdateTarget {
            asset_name: asset.name.clone(),
            url: asset.browser_download_url.clone(),
            digest,
        })
    }
}

impl ExpectedDigest {
    /// Accepts `sha256:<hex>` or a bare hex string.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let hex_part = match raw.split_once(':') {
            Some((algorithm, rest)) if algorithm.eq_ignore_ascii_case(DIGEST_ALGORITHM) => rest,
            Some((algorithm, _)) => {
                return Err(format!("unsupported digest algorithm '{algorithm}'"));
            }
            None => raw,
        };
        let bytes = hex::decode(hex_part).map_err(|err| format!("invalid digest hex: {err}"))?;
        if bytes.len() != DIGEST_LEN {
            return Err(format!(
                "digest must be {DIGEST_LEN} bytes, got {}",
                bytes.len()
            ));
        }
        Ok(Self(hex::encode(bytes)))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExpectedDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{DIGEST_ALGORITHM}:{}", self.0)
    }
}

#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn fetch_latest(&self) -> Result<ReleaseMetadata, ReleaseError>;
}

/// GitHub-style `/repos/{repo}/releases/latest` endpoint.
pub struct GithubReleaseSource {
    client: Client,
    url: String,
    timeout: Duration,
}

impl GithubReleaseSource {
    pub fn new(client: Client, api_base_url: &str, repo: &str, timeout: Duration) -> Self {
        Self {
            client,
            url: format!(
                "{}/repos/{}/releases/latest",
                api_base_url.trim_end_matches('/'),
                repo.trim_matches('/')
            ),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ReleaseSource for GithubReleaseSource {
    async fn fetch_latest(&self) -> Result<ReleaseMetadata, ReleaseError> {
        let resp = self
            .client
            .get(&self.url)
            .header("Accept", "application/vnd.github+json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(ReleaseError::Network)?;

        if !resp.status().is_success() {
            return Err(ReleaseError::UnexpectedStatus(resp.status()));
        }

        let body = resp.bytes().await.map_err(ReleaseError::Network)?;
        serde_json::from_slice(&body).map_err(|err| ReleaseError::Decode(err.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    pub(crate) const HEX_A: &str =
        "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    pub(crate) async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn release_json(tag: &str) -> String {
        format!(
            r#"{{"tag_name":"{tag}","html_url":"https://example.invalid","assets":[{{"name":"main.exe","digest":"sha256:{HEX_A}","browser_download_url":"https://example.invalid/main.exe","size":4}}]}}"#
        )
    }

    fn source(base: &str) -> GithubReleaseSource {
        GithubReleaseSource::new(Client::new(), base, "owner/panel", Duration::from_secs(5))
    }

    #[test]
    fn digest_parse_accepts_tagged_and_bare_hex() {
        let tagged = ExpectedDigest::parse(&format!("sha256:{HEX_A}")).unwrap();
        let bare = ExpectedDigest::parse(&HEX_A.to_uppercase()).unwrap();
        assert_eq!(tagged, bare);
        assert_eq!(tagged.as_hex(), HEX_A);
        assert_eq!(tagged.to_string(), format!("sha256:{HEX_A}"));
    }

    #[test]
    fn digest_parse_rejects_other_algorithms_and_short_hex() {
        assert!(ExpectedDigest::parse(&format!("sha512:{HEX_A}"))
            .unwrap_err()
            .contains("unsupported"));
        assert!(ExpectedDigest::parse("sha256:abcd").is_err());
        assert!(ExpectedDigest::parse("sha256:zz").is_err());
        assert!(ExpectedDigest::parse("").is_err());
    }

    #[test]
    fn target_uses_first_asset() {
        let release: ReleaseMetadata = serde_json::from_str(&release_json("v1.4.2")).unwrap();
        let target = release.target().unwrap();
        assert_eq!(target.asset_name, "main.exe");
        assert_eq!(target.url, "https://example.invalid/main.exe");
        assert_eq!(target.digest.as_hex(), HEX_A);
    }

    #[test]
    fn target_without_assets_is_decode_error() {
        let release = ReleaseMetadata {
            tag_name: "v2".to_string(),
            assets: vec![],
        };
        assert!(matches!(release.target(), Err(ReleaseError::Decode(_))));
    }

    #[test]
    fn null_digest_parses_but_has_no_target() {
        let json = r#"{"tag_name":"v1.4.1","assets":[{"name":"main.exe","digest":null,"browser_download_url":"https://example.invalid/main.exe"}]}"#;
        let release: ReleaseMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(release.assets[0].digest, None);

        match release.target() {
            Err(ReleaseError::Decode(msg)) => assert!(msg.contains("no digest"), "{msg}"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn url_is_built_from_base_and_repo() {
        let src = source("https://api.github.com/");
        assert_eq!(
            src.url(),
            "https://api.github.com/repos/owner/panel/releases/latest"
        );
    }

    #[tokio::test]
    async fn fetch_latest_decodes_release() {
        let app = Router::new().route(
            "/repos/owner/panel/releases/latest",
            get(|| async { release_json("v1.4.2") }),
        );
        let base = serve(app).await;

        let release = source(&base).fetch_latest().await.unwrap();
        assert_eq!(release.tag_name, "v1.4.2");
        assert_eq!(release.assets.len(), 1);
    }

    #[tokio::test]
    async fn fetch_latest_accepts_release_without_assets() {
        let app = Router::new().route(
            "/repos/owner/panel/releases/latest",
            get(|| async { r#"{"tag_name":"v1.4.1","assets":[]}"# }),
        );
        let base = serve(app).await;

        let release = source(&base).fetch_latest().await.unwrap();
        assert_eq!(release.tag_name, "v1.4.1");
        assert!(release.assets.is_empty());
    }

    #[tokio::test]
    async fn fetch_latest_reports_unexpected_status() {
        let app = Router::new().route(
            "/repos/owner/panel/releases/latest",
            get(|| async { (HttpStatus::FORBIDDEN, "rate limited") }),
        );
        let base = serve(app).await;

        match source(&base).fetch_latest().await {
            Err(ReleaseError::UnexpectedStatus(status)) => {
                assert_eq!(status, StatusCode::FORBIDDEN)
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fetch_latest_reports_schema_mismatch_as_decode() {
        let app = Router::new().route(
            "/repos/owner/panel/releases/latest",
            get(|| async { r#"{"message":"Not Found"}"# }),
        );
        let base = serve(app).await;

        assert!(matches!(
            source(&base).fetch_latest().await,
            Err(ReleaseError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn fetch_latest_reports_connection_failure_as_network() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = source(&format!("http://{addr}")).fetch_latest().await;
        assert!(matches!(result, Err(ReleaseError::Network(_))));
    }
}
