use std::{
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    pin::Pin,
    sync::Arc,
};

use hyper::header::{HeaderValue, HOST};
use hyper::{Body, Request, Version};
use rustls::ServerName;
use serde::Serialize;
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout, Duration, Instant};
use tokio_rustls::TlsConnector;

use crate::core::tls::default_client_config;

use super::registry::HealthRegistry;
use super::sources::CandidateSources;

/// 标准加密端口；探测与重定向拨号都固定在 443。
pub const PROBE_PORT: u16 = 443;
/// 零成功候选的延迟哨兵值（毫秒）。
pub const LATENCY_SENTINEL_MS: u64 = 9_999;
/// 手动/自动测速返回的最大结果条数。
pub const MAX_PROBE_RESULTS: usize = 5;

/// 单次探测的传输层失败分类。kind() 产出稳定字符串，写入失败台账。
#[derive(Debug, Clone, Error)]
pub enum ProbeTransportError {
    #[error("tcp connect failed: {0}")]
    Connect(String),
    #[error("tls handshake failed: {0}")]
    Tls(String),
    #[error("http request failed: {0}")]
    Http(String),
    #[error("probe timed out after {0}ms")]
    Timeout(u64),
}

impl ProbeTransportError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeTransportError::Connect(_) => "connect",
            ProbeTransportError::Tls(_) => "tls",
            ProbeTransportError::Http(_) => "http",
            ProbeTransportError::Timeout(_) => "timeout",
        }
    }
}

/// 单次探测结果。probe 永不抛错：失败也以结果对象表达。
#[derive(Debug, Clone)]
pub struct ProbeAttempt {
    pub success: bool,
    pub latency_ms: u64,
    pub error: Option<ProbeTransportError>,
}

pub type ProbeFuture = Pin<Box<dyn Future<Output = ProbeAttempt> + Send>>;

/// 探测传输抽象：对指定 IP 以 domain 为协议身份发起一次探测。
/// 生产实现为 HTTPS 探测；测试注入脚本化实现以获得确定性。
pub trait ProbeTransport: Send + Sync {
    fn probe(&self, domain: &str, ip: Ipv4Addr, timeout_ms: u64) -> ProbeFuture;
}

/// 生产探测实现：TCP 直连候选 IP，TLS SNI 与证书校验按真实域名执行，
/// 再发送 Host 为真实域名的最小 HEAD 请求。任何 HTTP 响应（含 4xx/5xx）
/// 都算成功；只有传输/握手/超时才算失败。
pub struct HttpsProbeTransport;

impl HttpsProbeTransport {
    async fn dial_and_head(domain: &str, ip: Ipv4Addr) -> Result<(), ProbeTransportError> {
        let addr = SocketAddr::new(IpAddr::V4(ip), PROBE_PORT);
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| ProbeTransportError::Connect(e.to_string()))?;

        let server_name = ServerName::try_from(domain)
            .map_err(|_| ProbeTransportError::Tls(format!("invalid sni host: {domain}")))?;
        let tls = TlsConnector::from(default_client_config());
        let stream = tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProbeTransportError::Tls(e.to_string()))?;

        let (mut sender, conn) = hyper::client::conn::handshake(stream)
            .await
            .map_err(|e| ProbeTransportError::Http(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!(target = "optimizer", "probe conn ended: {:?}", err);
            }
        });

        let mut req = Request::builder()
            .method("HEAD")
            .uri("/")
            .version(Version::HTTP_11)
            .body(Body::empty())
            .map_err(|e| ProbeTransportError::Http(e.to_string()))?;
        let host_value = HeaderValue::from_str(domain)
            .map_err(|e| ProbeTransportError::Http(e.to_string()))?;
        req.headers_mut().insert(HOST, host_value);

        // 响应头到达即视为成功，状态码不参与判定
        sender
            .send_request(req)
            .await
            .map_err(|e| ProbeTransportError::Http(e.to_string()))?;
        Ok(())
    }
}

impl ProbeTransport for HttpsProbeTransport {
    fn probe(&self, domain: &str, ip: Ipv4Addr, timeout_ms: u64) -> ProbeFuture {
        let domain = domain.to_string();
        Box::pin(async move {
            let start = Instant::now();
            match timeout(
                Duration::from_millis(timeout_ms),
                Self::dial_and_head(&domain, ip),
            )
            .await
            {
                Ok(Ok(())) => ProbeAttempt {
                    success: true,
                    latency_ms: (start.elapsed().as_millis() as u64).min(timeout_ms),
                    error: None,
                },
                Ok(Err(err)) => ProbeAttempt {
                    success: false,
                    latency_ms: (start.elapsed().as_millis() as u64).min(timeout_ms),
                    error: Some(err),
                },
                Err(_) => ProbeAttempt {
                    success: false,
                    latency_ms: timeout_ms,
                    error: Some(ProbeTransportError::Timeout(timeout_ms)),
                },
            }
        })
    }
}

/// 单个候选的聚合探测结果，供管理端与调度器消费。
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub ip: String,
    /// 成功样本的平均延迟；零成功时为哨兵值 9999。
    pub avg_latency_ms: u64,
    /// 0..1。
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_latency_ms: Option<u64>,
    /// 相对普通 DNS 基线的提升百分比（可为负）。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub improvement_percent: Option<i64>,
}

#[derive(Debug)]
struct CandidateStats {
    ip: Ipv4Addr,
    successes: u32,
    attempts: u32,
    total_latency_ms: u64,
    last_error: Option<ProbeTransportError>,
}

impl CandidateStats {
    fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            f64::from(self.successes) / f64::from(self.attempts)
        }
    }

    fn avg_latency_ms(&self) -> u64 {
        if self.successes == 0 {
            LATENCY_SENTINEL_MS
        } else {
            self.total_latency_ms / u64::from(self.successes)
        }
    }
}

/// 延迟探测器：聚合候选、剔除黑名单、分批并发探测并回写失败台账。
pub struct Prober {
    sources: Arc<CandidateSources>,
    registry: Arc<HealthRegistry>,
    transport: Arc<dyn ProbeTransport>,
    batch_size: usize,
}

impl Prober {
    pub fn new(
        sources: Arc<CandidateSources>,
        registry: Arc<HealthRegistry>,
        batch_size: usize,
    ) -> Self {
        Self::with_transport(sources, registry, batch_size, Arc::new(HttpsProbeTransport))
    }

    pub fn with_transport(
        sources: Arc<CandidateSources>,
        registry: Arc<HealthRegistry>,
        batch_size: usize,
        transport: Arc<dyn ProbeTransport>,
    ) -> Self {
        Self {
            sources,
            registry,
            transport,
            batch_size: batch_size.max(1),
        }
    }

    /// 对单个 (域名, IP) 做一次探测；永不抛错（见 ProbeAttempt）。
    pub async fn probe_one(&self, domain: &str, ip: Ipv4Addr, timeout_ms: u64) -> ProbeAttempt {
        self.transport.probe(domain, ip, timeout_ms).await
    }

    /// 对一个域名做完整测速：普通 DNS 基线 → 候选聚合与黑名单剔除 →
    /// 固定批次并发探测 → 失败落账 → 按平均延迟升序取前 5。
    /// 任何内部故障都降级为（可能为空的）结果列表，不向调用方抛错。
    pub async fn probe_domain(
        &self,
        domain: &str,
        test_count: u32,
        timeout_ms: u64,
    ) -> Vec<ProbeResult> {
        let test_count = test_count.max(1);
        let baseline = self.probe_baseline(domain, test_count, timeout_ms).await;

        let excluded = self.registry.blacklisted(domain);
        let candidates: Vec<Ipv4Addr> = self
            .sources
            .fetch_candidates()
            .await
            .into_iter()
            .filter(|ip| !excluded.contains(ip))
            .filter_map(|ip| ip.parse::<Ipv4Addr>().ok())
            .collect();

        if candidates.is_empty() {
            tracing::info!(
                target = "optimizer",
                domain,
                excluded = excluded.len(),
                "no probeable candidates after blacklist filtering"
            );
            return Vec::new();
        }

        tracing::debug!(
            target = "optimizer",
            domain,
            candidates = candidates.len(),
            excluded = excluded.len(),
            test_count,
            timeout_ms,
            "probing candidate set"
        );

        let mut stats: Vec<CandidateStats> = Vec::with_capacity(candidates.len());
        // 批与批严格串行：第 N+1 批在第 N 批全部落定后才提交
        for batch in candidates.chunks(self.batch_size) {
            let mut handles = Vec::with_capacity(batch.len());
            for &ip in batch {
                let transport = self.transport.clone();
                let domain = domain.to_string();
                handles.push(tokio::spawn(async move {
                    probe_candidate(transport.as_ref(), &domain, ip, test_count, timeout_ms).await
                }));
            }
            for handle in handles {
                match handle.await {
                    Ok(stat) => stats.push(stat),
                    Err(err) => {
                        tracing::warn!(target = "optimizer", domain, error = %err, "probe task join error");
                    }
                }
            }
        }

        for stat in stats.iter().filter(|s| s.successes == 0) {
            let (error_type, error_message) = match &stat.last_error {
                Some(err) => (Some(err.kind()), Some(err.to_string())),
                None => (None, None),
            };
            self.registry.record_failure(
                domain,
                &stat.ip.to_string(),
                error_type,
                error_message.as_deref(),
            );
        }

        let mut results: Vec<ProbeResult> = stats
            .iter()
            .filter(|s| s.successes > 0)
            .map(|s| {
                let avg = s.avg_latency_ms();
                let improvement = baseline.as_ref().map(|(_, base)| {
                    let base = *base as f64;
                    ((base - avg as f64) * 100.0 / base).round() as i64
                });
                ProbeResult {
                    ip: s.ip.to_string(),
                    avg_latency_ms: avg,
                    success_rate: s.success_rate(),
                    original_ip: baseline.as_ref().map(|(ip, _)| ip.to_string()),
                    original_latency_ms: baseline.as_ref().map(|(_, base)| *base),
                    improvement_percent: improvement,
                }
            })
            .collect();

        results.sort_by_key(|r| r.avg_latency_ms);
        results.truncate(MAX_PROBE_RESULTS);

        tracing::info!(
            target = "optimizer",
            domain,
            viable = results.len(),
            best_latency_ms = results.first().map(|r| r.avg_latency_ms),
            "probe sweep finished"
        );
        results
    }

    /// 普通 DNS 解析一次并尽力探测，作为提升百分比的基线；失败时忽略。
    async fn probe_baseline(
        &self,
        domain: &str,
        test_count: u32,
        timeout_ms: u64,
    ) -> Option<(Ipv4Addr, u64)> {
        let ip = resolve_first_v4(domain).await?;
        let stat = probe_candidate(self.transport.as_ref(), domain, ip, test_count, timeout_ms).await;
        if stat.successes == 0 {
            tracing::debug!(
                target = "optimizer",
                domain,
                baseline_ip = %ip,
                "dns baseline probe failed; improvement will be omitted"
            );
            return None;
        }
        Some((ip, stat.avg_latency_ms()))
    }
}

/// 单个候选在自己的任务内串行探测 test_count 次。
async fn probe_candidate(
    transport: &dyn ProbeTransport,
    domain: &str,
    ip: Ipv4Addr,
    test_count: u32,
    timeout_ms: u64,
) -> CandidateStats {
    let mut stat = CandidateStats {
        ip,
        successes: 0,
        attempts: 0,
        total_latency_ms: 0,
        last_error: None,
    };
    for _ in 0..test_count {
        let attempt = transport.probe(domain, ip, timeout_ms).await;
        stat.attempts += 1;
        if attempt.success {
            stat.successes += 1;
            stat.total_latency_ms += attempt.latency_ms;
        } else {
            stat.last_error = attempt.error;
        }
    }
    stat
}

async fn resolve_first_v4(domain: &str) -> Option<Ipv4Addr> {
    match lookup_host((domain, PROBE_PORT)).await {
        Ok(addrs) => addrs.into_iter().find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        }),
        Err(err) => {
            tracing::debug!(
                target = "optimizer",
                domain,
                error = %err,
                "dns baseline resolution failed"
            );
            None
        }
    }
}
