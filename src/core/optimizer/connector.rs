use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use hyper::header::{HeaderMap, HeaderValue, HOST};
use rustls::{ClientConfig, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::core::tls::default_client_config;

use super::resolver::DomainResolver;

/// 为单个目标域名定制的 TLS 拨号器：仅对捕获的域名替换拨号地址，
/// SNI 与证书校验始终使用真实主机名；其它主机走普通拨号。
#[derive(Clone)]
pub struct OptimizedConnector {
    domain: String,
    ip: Ipv4Addr,
    tls: Arc<ClientConfig>,
}

impl OptimizedConnector {
    pub fn new(domain: String, ip: Ipv4Addr, tls: Arc<ClientConfig>) -> Self {
        Self { domain, ip, tls }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<TlsStream<TcpStream>> {
        let tcp = if host.eq_ignore_ascii_case(&self.domain) {
            let addr = SocketAddr::new(IpAddr::V4(self.ip), port);
            tracing::debug!(
                target = "optimizer",
                host,
                ip = %self.ip,
                port,
                "dialing optimized endpoint"
            );
            TcpStream::connect(addr)
                .await
                .with_context(|| format!("connect optimized endpoint {addr} for {host}"))?
        } else {
            // 同一连接上出现的其它主机（如重定向）不做替换
            TcpStream::connect((host, port))
                .await
                .with_context(|| format!("connect {host}:{port}"))?
        };

        let server_name = ServerName::try_from(host)
            .map_err(|_| anyhow!("invalid sni host: {host}"))?;
        let connector = TlsConnector::from(self.tls.clone());
        let stream = connector
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("tls handshake with {host}"))?;
        Ok(stream)
    }
}

/// 工厂产物：拨号器与本次选中的 (域名, IP)，便于调用方记录与回报失败。
pub struct OptimizedConnection {
    pub connector: OptimizedConnector,
    pub domain: String,
    pub ip: Ipv4Addr,
}

/// 拨号器工厂：按请求 URL 询问解析器，命中才返回定制拨号器。
/// 任何故障（解析失败、非 https、未命中）都返回 None，绝不向
/// 请求热路径抛错，调用方直接回落普通拨号。
pub struct ConnectorFactory {
    resolver: Arc<DomainResolver>,
    tls: Arc<ClientConfig>,
}

impl ConnectorFactory {
    pub fn new(resolver: Arc<DomainResolver>) -> Self {
        Self {
            resolver,
            tls: default_client_config(),
        }
    }

    pub async fn build(&self, target_url: &str) -> Option<OptimizedConnection> {
        let url = match url::Url::parse(target_url) {
            Ok(u) => u,
            Err(err) => {
                tracing::debug!(
                    target = "optimizer",
                    url = target_url,
                    error = %err,
                    "unparsable url; skipping optimization"
                );
                return None;
            }
        };
        if url.scheme() != "https" {
            return None;
        }
        let host = url.host_str()?;
        // 字面 IP 不是可优化的域名
        if host.parse::<IpAddr>().is_ok() {
            return None;
        }

        let target = self.resolver.resolve(host).await?;
        Some(OptimizedConnection {
            connector: OptimizedConnector::new(
                host.to_ascii_lowercase(),
                target.ip,
                self.tls.clone(),
            ),
            domain: target.config_domain,
            ip: target.ip,
        })
    }
}

/// 确保请求头携带真实主机名：拨号目标换成字面 IP 后，
/// Host 必须仍指向原域名，否则对端路由会失败。
pub fn upsert_host_header(headers: &mut HeaderMap, real_host: &str) -> Result<()> {
    let value = HeaderValue::from_str(real_host)
        .with_context(|| format!("invalid host header value: {real_host}"))?;
    headers.insert(HOST, value);
    Ok(())
}
