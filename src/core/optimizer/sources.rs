use std::net::Ipv4Addr;

use anyhow::{anyhow, Context, Result};
use hyper::header::{HeaderValue, HOST, USER_AGENT};
use hyper::{Body, Request, Version};
use rustls::ServerName;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_rustls::TlsConnector;
use url::Url;

use crate::core::config::model::OptimizerCfg;
use crate::core::tls::default_client_config;

/// 单个远端源的拉取超时（毫秒）。
const SOURCE_FETCH_TIMEOUT_MS: u64 = 5_000;
/// 远端列表的响应体上限，防御异常大的镜像文件。
const MAX_SOURCE_BODY_BYTES: usize = 512 * 1024;

/// 候选 IP 聚合器：依次尝试主源、镜像源，全部失败时退回内置兜底列表。
/// 远端源的网络或解析错误从不向外暴露，只降级到下一级。
pub struct CandidateSources {
    endpoints: Vec<String>,
    timeout_ms: u64,
    fixed: Option<Vec<String>>,
}

impl CandidateSources {
    pub fn new(cfg: &OptimizerCfg) -> Self {
        Self {
            endpoints: vec![
                cfg.primary_source_url.clone(),
                cfg.mirror_source_url.clone(),
            ],
            timeout_ms: SOURCE_FETCH_TIMEOUT_MS,
            fixed: None,
        }
    }

    /// 固定候选列表，跳过远端拉取；用于测试与用户手工指定的场景。
    pub fn fixed(ips: Vec<String>) -> Self {
        Self {
            endpoints: Vec::new(),
            timeout_ms: SOURCE_FETCH_TIMEOUT_MS,
            fixed: Some(ips),
        }
    }

    pub async fn fetch_candidates(&self) -> Vec<String> {
        if let Some(fixed) = &self.fixed {
            return fixed.clone();
        }
        for endpoint in &self.endpoints {
            match timeout(
                Duration::from_millis(self.timeout_ms),
                https_get_text(endpoint),
            )
            .await
            {
                Ok(Ok(body)) => {
                    let ips = parse_ip_lines(&body);
                    if !ips.is_empty() {
                        tracing::debug!(
                            target = "optimizer",
                            endpoint = endpoint.as_str(),
                            count = ips.len(),
                            "candidate source fetched"
                        );
                        return ips;
                    }
                    tracing::debug!(
                        target = "optimizer",
                        endpoint = endpoint.as_str(),
                        "candidate source returned no parsable ips; trying next"
                    );
                }
                Ok(Err(err)) => {
                    tracing::debug!(
                        target = "optimizer",
                        endpoint = endpoint.as_str(),
                        error = %err,
                        "candidate source fetch failed; trying next"
                    );
                }
                Err(_) => {
                    tracing::debug!(
                        target = "optimizer",
                        endpoint = endpoint.as_str(),
                        timeout_ms = self.timeout_ms,
                        "candidate source fetch timed out; trying next"
                    );
                }
            }
        }
        tracing::info!(
            target = "optimizer",
            "all candidate sources failed; using builtin fallback list"
        );
        builtin_fallback()
    }
}

/// 逐行解析：仅保留点分四段的 IPv4 字面量，其余行静默丢弃。
pub(crate) fn parse_ip_lines(body: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.parse::<Ipv4Addr>().is_ok() && !out.iter().any(|seen| seen == trimmed) {
            out.push(trimmed.to_string());
        }
    }
    out
}

pub(crate) fn builtin_fallback() -> Vec<String> {
    FALLBACK_IPS.iter().map(|ip| ip.to_string()).collect()
}

/// 内置兜底列表：公开的 anycast 边缘段里的常见入口。
const FALLBACK_IPS: &[&str] = &[
    "104.16.160.1",
    "104.16.160.2",
    "104.17.64.1",
    "104.18.32.1",
    "104.19.128.1",
    "104.20.64.1",
    "104.21.48.1",
    "104.22.16.1",
    "104.24.80.1",
    "104.25.96.1",
    "104.26.0.1",
    "104.27.112.1",
    "162.159.36.1",
    "162.159.46.1",
    "172.64.32.1",
    "172.64.96.1",
    "172.65.16.1",
    "172.66.40.1",
    "172.67.64.1",
    "198.41.192.1",
];

/// 手动建立 TCP + TLS + hyper 连接后发起 GET，返回响应体文本。
/// 不跟随重定向；响应体超限时截断处理。
async fn https_get_text(endpoint: &str) -> Result<String> {
    let url = Url::parse(endpoint).with_context(|| format!("parse source url: {endpoint}"))?;
    if url.scheme() != "https" {
        return Err(anyhow!("candidate source must be https: {endpoint}"));
    }
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("source url missing host: {endpoint}"))?
        .to_string();
    let port = url.port().unwrap_or(443);

    let tcp = TcpStream::connect((host.as_str(), port))
        .await
        .with_context(|| format!("connect source {host}:{port}"))?;

    let server_name =
        ServerName::try_from(host.as_str()).map_err(|_| anyhow!("invalid sni host: {host}"))?;
    let tls = TlsConnector::from(default_client_config());
    let stream = tls
        .connect(server_name, tcp)
        .await
        .context("source tls handshake")?;

    let (mut sender, conn) = hyper::client::conn::handshake(stream)
        .await
        .context("source http handshake")?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::debug!(target = "optimizer", "source conn ended: {:?}", err);
        }
    });

    let path = match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    };
    let mut req = Request::builder()
        .method("GET")
        .uri(path)
        .version(Version::HTTP_11)
        .body(Body::empty())
        .context("build source request")?;
    req.headers_mut().insert(
        HOST,
        HeaderValue::from_str(&host).context("host header")?,
    );
    req.headers_mut()
        .insert(USER_AGENT, HeaderValue::from_static("upstream-optimizer"));

    let resp = sender.send_request(req).await.context("source request")?;
    if !resp.status().is_success() {
        return Err(anyhow!("source responded with status {}", resp.status()));
    }
    let bytes = hyper::body::to_bytes(resp.into_body())
        .await
        .context("read source body")?;
    let slice = if bytes.len() > MAX_SOURCE_BODY_BYTES {
        &bytes[..MAX_SOURCE_BODY_BYTES]
    } else {
        &bytes[..]
    };
    Ok(String::from_utf8_lossy(slice).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Builder;

    #[test]
    fn parse_ip_lines_keeps_only_dotted_quads() {
        let body = "104.16.1.1\n# comment\nnot-an-ip\n2606:4700::1\n104.16.1.2 \n104.16.1.1\n\n";
        let ips = parse_ip_lines(body);
        assert_eq!(
            ips,
            vec!["104.16.1.1".to_string(), "104.16.1.2".to_string()]
        );
    }

    #[test]
    fn parse_ip_lines_rejects_partial_and_overflowing_quads() {
        let ips = parse_ip_lines("1.2.3\n1.2.3.4.5\n256.1.1.1\n10.0.0.1");
        assert_eq!(ips, vec!["10.0.0.1".to_string()]);
    }

    #[test]
    fn builtin_fallback_is_nonempty_and_valid() {
        let ips = builtin_fallback();
        assert!(ips.len() >= 20);
        for ip in &ips {
            assert!(ip.parse::<Ipv4Addr>().is_ok(), "bad fallback literal {ip}");
        }
    }

    #[test]
    fn fixed_sources_skip_remote_fetch() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        let sources = CandidateSources::fixed(vec!["1.1.1.1".into(), "2.2.2.2".into()]);
        let ips = rt.block_on(sources.fetch_candidates());
        assert_eq!(ips, vec!["1.1.1.1".to_string(), "2.2.2.2".to_string()]);
    }

    #[test]
    fn unreachable_endpoints_fall_back_to_builtin() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        let sources = CandidateSources {
            // TEST-NET-3 保证不可达；超时调小避免拖慢测试
            endpoints: vec!["https://203.0.113.1/list.txt".into()],
            timeout_ms: 300,
            fixed: None,
        };
        let ips = rt.block_on(sources.fetch_candidates());
        assert_eq!(ips, builtin_fallback());
    }
}
