use std::sync::Arc;

use once_cell::sync::Lazy;
use rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore};

/// 基于 webpki 根证书构造 rustls ClientConfig（无客户端证书）。
/// 证书链与主机名校验始终按握手时传入的 ServerName 执行，
/// 因此拨号目标为字面 IP 时，以真实域名作为 ServerName 即可完成校验。
pub fn create_client_config() -> ClientConfig {
    let mut root_store = RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// 进程级共享的默认 TLS 客户端配置；根证书集只需构建一次。
pub fn default_client_config() -> Arc<ClientConfig> {
    static CONFIG: Lazy<Arc<ClientConfig>> = Lazy::new(|| Arc::new(create_client_config()));
    CONFIG.clone()
}
