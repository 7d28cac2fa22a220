//! HTTPS with automatically provisioned certificates (ACME, TLS-ALPN-01).
//!
//! The ACME client is configured with a fixed domain list, so the listener is restarted with
//! a fresh one whenever the router publishes a different set of certificate hosts.

use futures::StreamExt;
use log::{error, info, warn};
use rustls_acme::caches::DirCache;
use rustls_acme::AcmeConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

use super::Router;

/// Time open connections get to finish when the listener restarts.
const RESTART_GRACE: Duration = Duration::from_secs(10);

pub struct AcmeSettings {
    pub contact_email: String,
    pub cache_dir: PathBuf,
    /// Let's Encrypt production directory instead of staging.
    pub production: bool,
}

/// The domains to request certificates for.
///
/// Only hosts the router currently accepts qualify. Wildcard patterns are never included,
/// since they cannot be validated through TLS-ALPN-01.
pub fn certificate_domains(router: &Router) -> Vec<String> {
    router
        .certificate_hosts()
        .into_iter()
        .filter(|host| router.accepts(host))
        .collect()
}

/// Waits until the published host set differs from `current`.
///
/// `None` once the router is gone and the set can no longer change.
async fn next_domains(hosts: &mut watch::Receiver<Vec<String>>, current: &[String]) -> Option<Vec<String>> {
    loop {
        hosts.changed().await.ok()?;
        let next = hosts.borrow_and_update().clone();
        if next != current {
            return Some(next);
        }
    }
}

/// Serves `app` over HTTPS on `addr` until the server stops, following the router's
/// certificate hosts.
///
/// Certificates are cached in `settings.cache_dir` and renewed in the background.
pub async fn serve_https(
    addr: SocketAddr,
    app: axum::Router,
    router: &Router,
    settings: AcmeSettings,
) -> std::io::Result<()> {
    let mut hosts = router.subscribe_certificate_hosts();
    let mut domains = certificate_domains(router);

    loop {
        info!("TLS: requesting certificates for {}", domains.join(", "));
        let mut state = AcmeConfig::new(domains.clone())
            .contact_push(format!("mailto:{}", settings.contact_email))
            .cache(DirCache::new(settings.cache_dir.clone()))
            .directory_lets_encrypt(settings.production)
            .state();
        let acceptor = state.axum_acceptor(state.default_rustls_config());

        let renewals = tokio::spawn(async move {
            while let Some(event) = state.next().await {
                match event {
                    Ok(ok) => info!("TLS: {:?}", ok),
                    Err(err) => error!("TLS: {:?}", err),
                }
            }
        });

        let handle = axum_server::Handle::new();
        let server = axum_server::bind(addr)
            .handle(handle.clone())
            .acceptor(acceptor)
            .serve(app.clone().into_make_service());
        tokio::pin!(server);
        info!("TLS: listening on {}", addr);

        let next = tokio::select! {
            result = &mut server => {
                renewals.abort();
                return result;
            }
            next = next_domains(&mut hosts, &domains) => next,
        };

        let Some(next) = next else {
            warn!("TLS: router gone, certificate hosts are frozen");
            let result = server.await;
            renewals.abort();
            return result;
        };

        info!("TLS: certificate hosts changed, restarting listener");
        handle.graceful_shutdown(Some(RESTART_GRACE));
        let result = server.await;
        renewals.abort();
        result?;
        domains = next
            .into_iter()
            .filter(|host| router.accepts(host))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{DeploymentId, DeploymentManifest, Outcome, ResourceTable};
    use crate::runtime::fake::FakeRuntime;
    use harbor_protocol::{Config, ControlPlane, Service};
    use std::sync::Arc;

    fn manifest(nanos: u64, hosts: &[&str]) -> Arc<DeploymentManifest> {
        let config = Config::new(
            vec![Service::new("web", "web:1").with_hosts(hosts.iter().copied())],
            ControlPlane {
                host: "harbor.example.com".into(),
            },
        )
        .unwrap();
        Arc::new(DeploymentManifest::new(
            DeploymentId::from_nanos(nanos),
            chrono::Utc::now(),
            config,
            ResourceTable::new(),
            Outcome::Succeeded,
        ))
    }

    #[test]
    fn test_domains_follow_active_deployment() {
        let router = Router::new("harbor.example.com", 80, Arc::new(FakeRuntime::new()));
        assert_eq!(certificate_domains(&router), vec!["harbor.example.com"]);

        router
            .activate(manifest(1, &["www.example.com", "*.example.org"]))
            .unwrap();

        assert_eq!(
            certificate_domains(&router),
            vec!["harbor.example.com", "www.example.com"]
        );
    }

    #[tokio::test]
    async fn test_activated_hosts_reach_the_listener() {
        let router = Router::new("harbor.example.com", 80, Arc::new(FakeRuntime::new()));
        let mut hosts = router.subscribe_certificate_hosts();
        let current = certificate_domains(&router);

        router.activate(manifest(1, &["www.example.com"])).unwrap();
        assert_eq!(
            next_domains(&mut hosts, &current).await,
            Some(vec!["harbor.example.com".to_string(), "www.example.com".into()])
        );

        // Same hosts under a newer deployment: nothing to restart for.
        router.activate(manifest(2, &["www.example.com"])).unwrap();
        assert!(!hosts.has_changed().unwrap());

        router
            .activate(manifest(3, &["www.example.com", "shop.example.com"]))
            .unwrap();
        let current = vec!["harbor.example.com".to_string(), "www.example.com".into()];
        assert_eq!(
            next_domains(&mut hosts, &current).await,
            Some(vec![
                "harbor.example.com".to_string(),
                "www.example.com".into(),
                "shop.example.com".into(),
            ])
        );
    }

    #[tokio::test]
    async fn test_no_more_domains_once_router_is_dropped() {
        let router = Router::new("harbor.example.com", 80, Arc::new(FakeRuntime::new()));
        let mut hosts = router.subscribe_certificate_hosts();
        drop(router);
        assert_eq!(next_domains(&mut hosts, &[]).await, None);
    }
}
