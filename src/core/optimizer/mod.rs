//! 上游端点优化：对被 anycast 前置的 API 域名按连接粒度改写拨号地址。
//!
//! 各部件职责：
//! - [`store`]：域名配置、系统总开关与失败黑名单的持久化仓库；
//! - [`registry`]：失败计数的记录入口与排除策略抽象；
//! - [`sources`]：候选 IP 的多级来源（远端主源 → 镜像 → 内置兜底）；
//! - [`prober`]：SNI 保持的并发延迟探测；
//! - [`resolver`]：带 TTL 快照缓存的域名 → 候选 IP 解析；
//! - [`connector`]：按请求 URL 生成定制 TLS 拨号器的工厂；
//! - [`scheduler`]：后台周期性自动测速；
//! - [`manager`]：按配置装配以上部件的运行时门面。

pub mod connector;
pub mod manager;
pub mod prober;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod sources;
pub mod store;

pub use connector::{upsert_host_header, ConnectorFactory, OptimizedConnection, OptimizedConnector};
pub use manager::OptimizerRuntime;
pub use prober::{
    HttpsProbeTransport, ProbeAttempt, ProbeResult, ProbeTransport, ProbeTransportError, Prober,
    LATENCY_SENTINEL_MS, MAX_PROBE_RESULTS, PROBE_PORT,
};
pub use registry::{ExclusionPolicy, FailureCountPolicy, HealthRegistry};
pub use resolver::{DomainResolver, ResolvedTarget, ResolverStats};
pub use scheduler::{is_due, sweep_once, AutoTestContext, AutoTestService};
pub use sources::CandidateSources;
pub use store::{
    BlacklistEntry, ConfigStore, DomainConfigPatch, OptimizedDomainConfig, SystemToggle,
};
