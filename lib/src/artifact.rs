//! Artifact reference probing over HTTP: reachability, digest, content
//! type and length.

use std::time::Duration;

use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::deploy::ReferSpec;
use crate::host::AuthnKind;

/// Observed state of an artifact reference.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReferStatus {
    pub accessible: bool,
    /// `algorithm:checksum`, currently always SHA-256.
    pub digest: String,
    pub content_type: String,
    pub length: u64,
}

/// Fetches the reference and hashes its body. A failure here means the
/// reference is presently unobservable; callers decide whether that is a
/// warning or an error.
pub async fn probe(refer: &ReferSpec) -> Result<ReferStatus> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")));
    if refer.insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }
    let client = builder.build().context("failed to build HTTP client")?;

    let mut request = client.get(&refer.uri);
    if let Some(authn) = &refer.authn {
        request = match authn.kind {
            AuthnKind::Bearer => request.bearer_auth(&authn.secret),
            _ => request.basic_auth(&authn.user, Some(&authn.secret)),
        };
    }

    let mut response = request.send().await.context("failed to do request")?;
    ensure!(
        response.status() == reqwest::StatusCode::OK,
        "unexpected status code: {}",
        response.status().as_u16()
    );

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut hasher = Sha256::new();
    let mut length = 0u64;
    while let Some(chunk) = response.chunk().await.context("failed to hash response")? {
        hasher.update(&chunk);
        length += chunk.len() as u64;
    }

    let digest: String = hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect();

    Ok(ReferStatus {
        accessible: true,
        digest: format!("sha256:{digest}"),
        content_type,
        length,
    })
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;

    async fn spawn_http(body: &'static [u8], content_type: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = conn.read(&mut buf).await;
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = conn.write_all(head.as_bytes()).await;
                    let _ = conn.write_all(body).await;
                });
            }
        });
        format!("http://{addr}/artifact.tar")
    }

    #[tokio::test]
    async fn probe_hashes_the_body() {
        let uri = spawn_http(b"hello artifact", "application/x-tar").await;
        let refer = ReferSpec {
            uri,
            authn: None,
            insecure: false,
        };

        let status = probe(&refer).await.unwrap();
        assert!(status.accessible);
        assert_eq!(status.length, 14);
        assert_eq!(status.content_type, "application/x-tar");
        // sha256 of "hello artifact"
        assert!(status.digest.starts_with("sha256:"));
        assert_eq!(status.digest.len(), "sha256:".len() + 64);
    }

    #[tokio::test]
    async fn probe_reports_unexpected_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = conn.read(&mut buf).await;
                let _ = conn
                    .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            }
        });

        let refer = ReferSpec {
            uri: format!("http://{addr}/missing"),
            authn: None,
            insecure: false,
        };

        let err = probe(&refer).await.unwrap_err();
        assert!(format!("{err:#}").contains("unexpected status code: 404"));
    }
}
