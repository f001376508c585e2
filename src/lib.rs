#![deny(clippy::unwrap_used)]

use std::time::Duration;

pub mod aliexpress;
pub mod category;
pub mod config;
pub mod csv;
pub mod feed;
pub mod fetch;
pub mod price;
pub mod product;
pub mod reconcile;
pub mod service;
pub mod sync;
pub mod sync_job;
pub mod transform;
pub mod xml;

/// Parses human durations like `6h`, `30m` or `1h 30m`.
pub fn parse_duration(duration: &str) -> Result<Duration, anyhow::Error> {
    let duration = duration.trim().to_lowercase().replace('.', "");
    duration_str::parse(duration).map_err(|dur| anyhow::anyhow!("Unable to parse duration {dur}"))
}

#[cfg(test)]
pub mod test {

    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves `respond(path)` as the raw HTTP response to every request on a
    /// local port. Returns the base URL.
    pub async fn stub_server(respond: fn(&str) -> String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    let head_end = loop {
                        let n = socket.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(i) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            break i + 4;
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                    let length = head
                        .lines()
                        .filter_map(|l| l.split_once(':'))
                        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    while buf.len() < head_end + length {
                        let n = socket.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let _ = socket.write_all(respond(&path).as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    pub fn http_response(status: &str, headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\n{headers}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    /// Client that ignores proxy settings of the environment.
    pub fn local_client() -> reqwest::Client {
        reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("6h").unwrap(), Duration::from_secs(6 * 60 * 60));
        assert_eq!(parse_duration(" 30M ").unwrap(), Duration::from_secs(30 * 60));
        assert!(parse_duration("soon").is_err());
    }
}
