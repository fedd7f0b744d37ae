//! Process-wide routing table: destination host → cluster.
//!
//! The registry owns the configured clusters (non-wildcard patterns
//! first, then wildcard — lookups take the first match), a capped list
//! of temporary clusters created on demand for unconfigured hosts, and
//! the default pool they all share. Two long-lived background tasks
//! hang off it: the certificate checker, which probes every configured
//! cluster on a runtime-mutable cadence, and the housekeeper, which
//! expires idle temporary clusters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use polyproxy_settings as settings;
use tracing::info;

use crate::{BlockHost, Cluster, HostPattern, OutProxy};

/// Temporary clusters are dropped beyond this count; overflow traffic
/// falls back to the default cluster.
const TEMP_CLUSTER_CAP: usize = 100;

/// Idle lifetime of a temporary cluster; refreshed on every lookup hit.
const TEMP_CLUSTER_TTL: Duration = Duration::from_secs(60 * 60);

/// Cadence of the housekeeper pass.
const HOUSEKEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Stagger between per-cluster probe spawns within one checker cycle.
const CERT_CHECK_STAGGER: Duration = Duration::from_secs(1);

/// The `fast` checker cadence (also the startup default).
const CERT_CHECK_FAST: Duration = Duration::from_secs(10 * 60);

/// The `slow` checker cadence.
const CERT_CHECK_SLOW: Duration = Duration::from_secs(60 * 60);

/// Routing table and background-task anchor, built once from config.
pub struct Registry {
    listen: String,
    middle_addr: Option<String>,
    /// Configured clusters, non-wildcard before wildcard.
    clusters: Vec<Arc<Cluster>>,
    /// On-demand clusters for unconfigured hosts. Appended by lookups,
    /// rebuilt by the housekeeper, read by the admin API — all under
    /// this mutex.
    temp_clusters: Mutex<Vec<Arc<Cluster>>>,
    default_cluster: Arc<Cluster>,
    direct_hosts: Vec<HostPattern>,
    block_hosts: Vec<BlockHost>,
    cert_check_interval_ms: AtomicU64,
}

impl Registry {
    /// Build the routing table from a parsed config file.
    ///
    /// Every cluster, configured or default, is seeded with the same
    /// shared [`OutProxy`] handles in `[upstream]` order.
    pub fn from_config(config: &settings::Config) -> Self {
        let proxies: Vec<Arc<OutProxy>> = config
            .upstreams
            .iter()
            .map(|addr| Arc::new(OutProxy::new(addr.clone())))
            .collect();

        let mut nowild = Vec::new();
        let mut wild = Vec::new();
        for spec in &config.clusters {
            let pattern = HostPattern::new(&spec.pattern);
            let cluster = Arc::new(Cluster::new(
                pattern,
                spec.cert_host.clone(),
                proxies.clone(),
            ));
            info!(cluster = %cluster.cert_host(), pattern = %cluster.host(), "cluster");
            if cluster.host().is_wild() {
                wild.push(cluster);
            } else {
                nowild.push(cluster);
            }
        }
        let mut clusters = nowild;
        clusters.append(&mut wild);

        let default_cluster = Arc::new(Cluster::new(
            HostPattern::new(""),
            "DEFAULT".to_string(),
            proxies,
        ));
        info!(cluster = %default_cluster.cert_host(), "default cluster");

        Self {
            listen: config.listen.clone(),
            middle_addr: config.middle.clone(),
            clusters,
            temp_clusters: Mutex::new(Vec::new()),
            default_cluster,
            direct_hosts: config.direct.iter().map(|p| HostPattern::new(p)).collect(),
            block_hosts: config.block.iter().map(|p| BlockHost::new(p)).collect(),
            cert_check_interval_ms: AtomicU64::new(CERT_CHECK_FAST.as_millis() as u64),
        }
    }

    pub fn listen(&self) -> &str {
        &self.listen
    }

    pub fn middle_addr(&self) -> Option<&str> {
        self.middle_addr.as_deref()
    }

    pub fn clusters(&self) -> &[Arc<Cluster>] {
        &self.clusters
    }

    pub fn default_cluster(&self) -> &Arc<Cluster> {
        &self.default_cluster
    }

    pub fn block_hosts(&self) -> &[BlockHost] {
        &self.block_hosts
    }

    pub fn direct_hosts(&self) -> &[HostPattern] {
        &self.direct_hosts
    }

    /// Match the host against the block list, counting the hit.
    pub fn check_block(&self, host: &str) -> bool {
        self.block_hosts.iter().any(|b| b.matches(host))
    }

    /// True when the host bypasses cluster routing.
    pub fn check_direct(&self, host: &str) -> bool {
        self.direct_hosts.iter().any(|d| d.matches(host))
    }

    /// Resolve the cluster serving a destination host.
    ///
    /// Configured clusters first, then live temporary clusters (a hit
    /// refreshes their expiry). An unconfigured host gets a fresh
    /// temporary cluster sharing the default pool, unless the cap is
    /// reached, in which case the default cluster serves it directly.
    pub fn lookup_cluster(&self, host: &str) -> Arc<Cluster> {
        for cluster in &self.clusters {
            if cluster.matches(host) {
                return Arc::clone(cluster);
            }
        }

        let mut temps = self
            .temp_clusters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for cluster in temps.iter() {
            if cluster.matches(host) {
                cluster.refresh_expire(TEMP_CLUSTER_TTL);
                return Arc::clone(cluster);
            }
        }
        if temps.len() >= TEMP_CLUSTER_CAP {
            return Arc::clone(&self.default_cluster);
        }

        let pool = self.default_cluster.proxies_snapshot();
        let cluster = Arc::new(Cluster::new(
            HostPattern::new(host),
            format!("Temporary for {host}"),
            pool,
        ));
        cluster.refresh_expire(TEMP_CLUSTER_TTL);
        info!(host, "temporary cluster created");
        temps.push(Arc::clone(&cluster));
        cluster
    }

    /// Configured cluster by its cert host (admin lookups).
    pub fn find_cluster(&self, cert_host: &str) -> Option<Arc<Cluster>> {
        self.clusters
            .iter()
            .find(|c| c.cert_host() == cert_host)
            .cloned()
    }

    /// Temporary cluster by the host it was created for (admin lookups).
    pub fn find_temp_cluster(&self, host: &str) -> Option<Arc<Cluster>> {
        let wanted = format!("Temporary for {host}");
        self.temp_clusters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|c| c.cert_host() == wanted)
            .cloned()
    }

    /// Snapshot of the live temporary clusters.
    pub fn temp_clusters_snapshot(&self) -> Vec<Arc<Cluster>> {
        self.temp_clusters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Pool member by address (admin lookups; the default cluster sees
    /// every configured proxy).
    pub fn find_outproxy(&self, addr: &str) -> Option<Arc<OutProxy>> {
        self.default_cluster
            .proxies_snapshot()
            .into_iter()
            .find(|p| p.addr() == addr)
    }

    pub fn cert_check_interval(&self) -> Duration {
        Duration::from_millis(self.cert_check_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_cert_check_fast(&self) {
        self.cert_check_interval_ms
            .store(CERT_CHECK_FAST.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_cert_check_slow(&self) {
        self.cert_check_interval_ms
            .store(CERT_CHECK_SLOW.as_millis() as u64, Ordering::Relaxed);
    }

    /// Kick off one probe sweep over every configured cluster, one
    /// spawn per second so the probes don't stampede the pool.
    pub fn do_cert_check(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            for cluster in &registry.clusters {
                let middle = registry.middle_addr.clone();
                tokio::spawn(Arc::clone(cluster).cert_check(middle));
                tokio::time::sleep(CERT_CHECK_STAGGER).await;
            }
        });
    }

    /// Background certificate checker: sweep, sleep, repeat. The sleep
    /// re-reads the interval so admin cadence changes apply on the next
    /// cycle.
    pub async fn cert_checker(self: Arc<Self>) {
        loop {
            self.do_cert_check();
            tokio::time::sleep(self.cert_check_interval()).await;
        }
    }

    /// Drop expired temporary clusters. Returns `(before, after)`.
    pub fn housekeep_once(&self) -> (usize, usize) {
        let mut temps = self
            .temp_clusters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let before = temps.len();
        temps.retain(|c| !c.is_expired());
        let after = temps.len();
        if before != after {
            info!(before, after, "housekeeper: reduce temp clusters");
        }
        (before, after)
    }

    /// Background housekeeper for temporary clusters.
    pub async fn house_keeper(self: Arc<Self>) {
        loop {
            self.housekeep_once();
            tokio::time::sleep(HOUSEKEEP_INTERVAL).await;
        }
    }

    /// Dump the live state in the config file format.
    pub fn dump_config(&self) -> String {
        let mut out = String::from("# generated from running state\n");
        out.push_str("[server]\n");
        out.push_str(&self.listen);
        out.push('\n');
        out.push_str("[upstream]\n");
        for proxy in self.default_cluster.proxies_snapshot() {
            out.push_str(proxy.addr());
            out.push('\n');
        }
        out.push_str("[proxy]\n");
        if let Some(middle) = &self.middle_addr {
            out.push_str(middle);
            out.push('\n');
        }
        out.push_str("[direct]\n");
        for host in &self.direct_hosts {
            out.push_str(&host.to_string());
            out.push('\n');
        }
        out.push_str("[cluster]\n");
        for cluster in &self.clusters {
            out.push_str(&format!("{}={}\n", cluster.cert_host(), cluster.host()));
        }
        out.push_str("[block]\n");
        for host in &self.block_hosts {
            out.push_str(&host.to_string());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_from(text: &str) -> Arc<Registry> {
        let config = settings::Config::parse(text).unwrap();
        Arc::new(Registry::from_config(&config))
    }

    const BASE_CONFIG: &str = "\
[server]
127.0.0.1:0
[upstream]
proxy-a.test:3128
proxy-b.test:3128
[direct]
*.internal.test
[cluster]
www.example.com=www.example.com
wild.example.net=*.example.net
[block]
ads.test
";

    // ========================================================================
    // Construction Tests
    // ========================================================================

    #[test]
    fn test_from_config_seeds_shared_proxies() {
        let registry = registry_from(BASE_CONFIG);
        assert_eq!(registry.clusters().len(), 2);

        // Every cluster and the default share the same OutProxy handles.
        let default_pool = registry.default_cluster().proxies_snapshot();
        assert_eq!(default_pool.len(), 2);
        for cluster in registry.clusters() {
            let pool = cluster.proxies_snapshot();
            assert_eq!(pool.len(), 2);
            for (a, b) in pool.iter().zip(default_pool.iter()) {
                assert!(Arc::ptr_eq(a, b));
            }
        }
    }

    #[test]
    fn test_from_config_orders_nonwild_before_wild() {
        let text = "\
[server]
a:1
[upstream]
b:2
[cluster]
wild.test=*.dual.test
exact.test=exact.dual.test
";
        let registry = registry_from(text);
        assert!(!registry.clusters()[0].host().is_wild());
        assert!(registry.clusters()[1].host().is_wild());
    }

    #[test]
    fn test_default_cluster_name() {
        let registry = registry_from(BASE_CONFIG);
        assert_eq!(registry.default_cluster().cert_host(), "DEFAULT");
    }

    // ========================================================================
    // Block / Direct Matching
    // ========================================================================

    #[test]
    fn test_check_block_counts() {
        let registry = registry_from(BASE_CONFIG);
        assert!(registry.check_block("ads.test"));
        assert!(!registry.check_block("www.example.com"));
        assert_eq!(registry.block_hosts()[0].blocked(), 1);
    }

    #[test]
    fn test_check_direct_wildcard() {
        let registry = registry_from(BASE_CONFIG);
        assert!(registry.check_direct("git.internal.test"));
        assert!(!registry.check_direct("internal.test"));
        assert!(!registry.check_direct("www.example.com"));
    }

    // ========================================================================
    // Cluster Lookup
    // ========================================================================

    #[test]
    fn test_lookup_configured_exact() {
        let registry = registry_from(BASE_CONFIG);
        let cluster = registry.lookup_cluster("www.example.com");
        assert_eq!(cluster.cert_host(), "www.example.com");
    }

    #[test]
    fn test_lookup_configured_wildcard() {
        let registry = registry_from(BASE_CONFIG);
        let cluster = registry.lookup_cluster("api.example.net");
        assert_eq!(cluster.cert_host(), "wild.example.net");
    }

    #[test]
    fn test_lookup_unconfigured_creates_temporary() {
        let registry = registry_from(BASE_CONFIG);
        let cluster = registry.lookup_cluster("foo.test");
        assert_eq!(cluster.cert_host(), "Temporary for foo.test");
        assert!(!cluster.is_expired());

        // The pool is shared with the default cluster by reference.
        let default_pool = registry.default_cluster().proxies_snapshot();
        for (a, b) in cluster.proxies_snapshot().iter().zip(default_pool.iter()) {
            assert!(Arc::ptr_eq(a, b));
        }
        assert_eq!(registry.temp_clusters_snapshot().len(), 1);
    }

    #[test]
    fn test_lookup_temporary_is_reused() {
        let registry = registry_from(BASE_CONFIG);
        let first = registry.lookup_cluster("foo.test");
        let second = registry.lookup_cluster("foo.test");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.temp_clusters_snapshot().len(), 1);
    }

    #[test]
    fn test_lookup_temp_cap_falls_back_to_default() {
        let registry = registry_from(BASE_CONFIG);
        for i in 0..TEMP_CLUSTER_CAP {
            registry.lookup_cluster(&format!("host{i}.test"));
        }
        assert_eq!(registry.temp_clusters_snapshot().len(), TEMP_CLUSTER_CAP);

        let overflow = registry.lookup_cluster("overflow.test");
        assert_eq!(overflow.cert_host(), "DEFAULT");
        assert_eq!(registry.temp_clusters_snapshot().len(), TEMP_CLUSTER_CAP);
    }

    #[test]
    fn test_find_temp_cluster_by_host() {
        let registry = registry_from(BASE_CONFIG);
        registry.lookup_cluster("foo.test");
        assert!(registry.find_temp_cluster("foo.test").is_some());
        assert!(registry.find_temp_cluster("bar.test").is_none());
    }

    #[test]
    fn test_find_outproxy_by_addr() {
        let registry = registry_from(BASE_CONFIG);
        let proxy = registry.find_outproxy("proxy-a.test:3128").unwrap();
        assert_eq!(proxy.addr(), "proxy-a.test:3128");
        assert!(registry.find_outproxy("absent.test:1").is_none());
    }

    // ========================================================================
    // Housekeeper
    // ========================================================================

    #[test]
    fn test_housekeep_once_drops_expired() {
        let registry = registry_from(BASE_CONFIG);
        let doomed = registry.lookup_cluster("doomed.test");
        registry.lookup_cluster("alive.test");
        assert_eq!(registry.temp_clusters_snapshot().len(), 2);

        doomed.force_expire();
        let (before, after) = registry.housekeep_once();
        assert_eq!((before, after), (2, 1));
        assert!(registry.find_temp_cluster("doomed.test").is_none());
        assert!(registry.find_temp_cluster("alive.test").is_some());
    }

    #[test]
    fn test_housekeep_once_keeps_fresh() {
        let registry = registry_from(BASE_CONFIG);
        registry.lookup_cluster("fresh.test");
        let (before, after) = registry.housekeep_once();
        assert_eq!((before, after), (1, 1));
    }

    // ========================================================================
    // Cadence
    // ========================================================================

    #[test]
    fn test_cert_check_interval_defaults_fast() {
        let registry = registry_from(BASE_CONFIG);
        assert_eq!(registry.cert_check_interval(), CERT_CHECK_FAST);
    }

    #[test]
    fn test_cert_check_interval_mutable() {
        let registry = registry_from(BASE_CONFIG);
        registry.set_cert_check_slow();
        assert_eq!(registry.cert_check_interval(), CERT_CHECK_SLOW);
        registry.set_cert_check_fast();
        assert_eq!(registry.cert_check_interval(), CERT_CHECK_FAST);
    }

    // ========================================================================
    // Config Dump
    // ========================================================================

    #[test]
    fn test_dump_config_roundtrip() {
        let registry = registry_from(BASE_CONFIG);
        let dumped = registry.dump_config();
        let reparsed = settings::Config::parse(&dumped).unwrap();

        assert_eq!(reparsed.listen, "127.0.0.1:0");
        assert_eq!(
            reparsed.upstreams,
            vec!["proxy-a.test:3128", "proxy-b.test:3128"]
        );
        assert!(reparsed.middle.is_none());
        assert_eq!(reparsed.direct, vec!["*.internal.test"]);
        assert_eq!(reparsed.clusters.len(), 2);
        assert_eq!(reparsed.block, vec!["ads.test"]);

        // A second registry built from the dump dumps identically.
        let second = Registry::from_config(&reparsed);
        assert_eq!(second.dump_config(), dumped);
    }

    #[test]
    fn test_dump_config_with_middle() {
        let text = "[server]\na:1\n[upstream]\nb:2\n[proxy]\nhop.test:8080\n";
        let registry = registry_from(text);
        let reparsed = settings::Config::parse(&registry.dump_config()).unwrap();
        assert_eq!(reparsed.middle.as_deref(), Some("hop.test:8080"));
    }
}
