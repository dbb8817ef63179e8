//! Host name resolution over DNS-over-HTTPS (JSON API).

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Resolves a host name to a single IPv4 address.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `host` to the first usable A record.
    async fn resolve_ipv4(&self, host: &str) -> Result<Ipv4Addr>;
}

#[async_trait]
impl<R: Resolver + ?Sized> Resolver for Arc<R> {
    async fn resolve_ipv4(&self, host: &str) -> Result<Ipv4Addr> {
        (**self).resolve_ipv4(host).await
    }
}

/// Response body of a `application/dns-json` query.
#[derive(Debug, Deserialize)]
pub struct DnsJsonResponse {
    /// DNS RCODE (0 = NOERROR)
    #[serde(rename = "Status")]
    pub status: u32,
    /// Answer section, absent on NXDOMAIN
    #[serde(rename = "Answer", default)]
    pub answer: Vec<DnsJsonAnswer>,
}

/// One answer record.
#[derive(Debug, Deserialize)]
pub struct DnsJsonAnswer {
    /// Record data; an address for A records, a name for CNAMEs
    pub data: String,
}

impl DnsJsonResponse {
    /// First answer whose data is a dotted-quad IPv4 address.
    pub fn first_ipv4(&self) -> Option<Ipv4Addr> {
        if self.status != 0 {
            return None;
        }
        self.answer
            .iter()
            .find_map(|a| a.data.trim().parse::<Ipv4Addr>().ok())
    }
}

/// DNS-over-HTTPS resolver issuing `GET ?name=<host>&type=A`.
///
/// Environment proxy settings are ignored; lookups always go straight to
/// the endpoint.
#[derive(Debug, Clone)]
pub struct DohResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl DohResolver {
    /// Create a resolver for the given JSON endpoint.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Endpoint queried by this resolver.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Resolver for DohResolver {
    async fn resolve_ipv4(&self, host: &str) -> Result<Ipv4Addr> {
        tracing::debug!("DNS lookup for {}", host);

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("name", host), ("type", "A")])
            .header(ACCEPT, "application/dns-json")
            .send()
            .await?;

        let body: DnsJsonResponse = response.json().await?;
        match body.first_ipv4() {
            Some(ip) => {
                tracing::debug!("DNS lookup result for {}: {}", host, ip);
                Ok(ip)
            }
            None => Err(Error::resolve(format!(
                "no IPv4 address for {} (status {})",
                host, body.status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_DOH_ENDPOINT;

    fn parse(json: &str) -> DnsJsonResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_first_ipv4_skips_cname() {
        let body = parse(
            r#"{"Status":0,"Answer":[
                {"name":"www.example.com","type":5,"TTL":300,"data":"example.cdn.net."},
                {"name":"example.cdn.net","type":1,"TTL":300,"data":"104.16.1.1"},
                {"name":"example.cdn.net","type":1,"TTL":300,"data":"104.16.1.2"}
            ]}"#,
        );
        assert_eq!(body.first_ipv4(), Some(Ipv4Addr::new(104, 16, 1, 1)));
    }

    #[test]
    fn test_failure_shapes() {
        assert_eq!(parse(r#"{"Status":3}"#).first_ipv4(), None);
        assert_eq!(parse(r#"{"Status":0,"Answer":[]}"#).first_ipv4(), None);
        assert_eq!(
            parse(r#"{"Status":2,"Answer":[{"data":"1.2.3.4"}]}"#).first_ipv4(),
            None
        );
        assert_eq!(
            parse(r#"{"Status":0,"Answer":[{"data":"999.1.1.1"},{"data":"alias."}]}"#).first_ipv4(),
            None
        );
    }

    #[test]
    fn test_endpoint() {
        let resolver = DohResolver::new("https://dns.example/dns-query").unwrap();
        assert_eq!(resolver.endpoint(), "https://dns.example/dns-query");
        let resolver = DohResolver::new(DEFAULT_DOH_ENDPOINT).unwrap();
        assert_eq!(resolver.endpoint(), "https://cloudflare-dns.com/dns-query");
    }

    /// One-shot HTTP server answering with `body`; yields the request head.
    async fn serve_once(body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/dns-json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            sock.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&head).to_string()
        });
        (format!("http://{}/dns-query", addr), handle)
    }

    #[tokio::test]
    async fn test_query_shape_and_answer() {
        let (endpoint, server) =
            serve_once(r#"{"Status":0,"Answer":[{"type":1,"data":"104.16.1.1"}]}"#).await;
        let resolver = DohResolver::new(endpoint).unwrap();

        let ip = resolver.resolve_ipv4("edge.example").await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(104, 16, 1, 1));

        let head = server.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /dns-query?name=edge.example&type=a "));
        assert!(head.contains("accept: application/dns-json"));
    }

    #[tokio::test]
    async fn test_nxdomain_is_error() {
        let (endpoint, _server) = serve_once(r#"{"Status":3}"#).await;
        let resolver = DohResolver::new(endpoint).unwrap();
        let err = resolver.resolve_ipv4("missing.example").await.unwrap_err();
        assert!(matches!(err, Error::Resolve(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        // Nothing listens on port 9 of the loopback interface
        let resolver = DohResolver::new("http://127.0.0.1:9/dns-query").unwrap();
        assert!(resolver.resolve_ipv4("example.com").await.is_err());
    }
}
