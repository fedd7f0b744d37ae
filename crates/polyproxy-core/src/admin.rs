//! Admin API: text-bodied state dumps and targeted operations.
//!
//! Any request whose target has no host lands here. Dispatch is purely
//! path-based and method-insensitive; responses are plain text. Status
//! codes carry no meaning on this surface.

use std::sync::Arc;
use std::time::SystemTime;

use crate::{Cluster, Registry, RequestHead};

/// Render one cluster in the dump format: the `certHost=pattern` line,
/// the last probe result, then one indented row per pool member.
pub(crate) fn make_cluster_blob(cluster: &Cluster) -> String {
    let mut out = format!("{}={}\n", cluster.cert_host(), cluster.host());
    match cluster.cert_ok() {
        Some(time) => {
            out.push_str("check time:");
            out.push_str(&format_ansic(time));
            out.push('\n');
        }
        None => out.push_str("bad cluster\n"),
    }
    for proxy in cluster.proxies_snapshot() {
        out.push(' ');
        out.push_str(&proxy.line());
    }
    out
}

/// `Mon Jan  2 15:04:05 2006`-style timestamp in local time.
fn format_ansic(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Local>::from(time)
        .format("%a %b %e %H:%M:%S %Y")
        .to_string()
}

/// Dispatch one admin request and produce the response body.
pub(crate) fn handle_api(registry: &Arc<Registry>, head: &RequestHead) -> String {
    let path = head.target.split('?').next().unwrap_or("");
    let dirs: Vec<&str> = path.split('/').skip(1).collect();
    match dirs.first().copied() {
        Some("config") => registry.dump_config(),
        Some("clusters") => dump_clusters(registry),
        Some("outproxies") => dump_outproxies(registry),
        Some("blockhosts") => dump_block_hosts(registry),
        Some("certcheck") => api_certcheck(registry, &dirs[1..]),
        Some("cluster") => api_cluster(registry, &dirs[1..]),
        Some("temp") => api_temp(registry, &dirs[1..]),
        Some("outproxy") => api_outproxy(registry, &dirs[1..]),
        Some("block") => api_block(registry, &dirs[1..]),
        _ => String::new(),
    }
}

fn dump_clusters(registry: &Registry) -> String {
    registry
        .clusters()
        .iter()
        .map(|c| make_cluster_blob(c))
        .collect()
}

fn dump_outproxies(registry: &Registry) -> String {
    registry
        .default_cluster()
        .proxies_snapshot()
        .iter()
        .map(|p| p.line())
        .collect()
}

fn dump_block_hosts(registry: &Registry) -> String {
    registry
        .block_hosts()
        .iter()
        .map(|b| format!("{} {}\n", b, b.blocked()))
        .collect()
}

fn api_certcheck(registry: &Arc<Registry>, api: &[&str]) -> String {
    match api.first().copied() {
        Some("fast") => {
            registry.set_cert_check_fast();
            "Set certcheck fast\n".to_string()
        }
        Some("slow") => {
            registry.set_cert_check_slow();
            "Set certcheck slow\n".to_string()
        }
        Some("issue") | None => {
            registry.do_cert_check();
            "Issue certcheck\n".to_string()
        }
        Some(_) => String::new(),
    }
}

fn api_cluster(registry: &Registry, api: &[&str]) -> String {
    let [name, cmd, ..] = api else {
        return String::new();
    };
    let Some(cluster) = registry.find_cluster(name) else {
        return String::new();
    };
    cluster_op(&cluster, cmd)
}

fn api_temp(registry: &Registry, api: &[&str]) -> String {
    match api {
        ["list", ..] => registry
            .temp_clusters_snapshot()
            .iter()
            .map(|c| make_cluster_blob(c))
            .collect(),
        [name, cmd, ..] => {
            let Some(cluster) = registry.find_temp_cluster(name) else {
                return String::new();
            };
            cluster_op(&cluster, cmd)
        }
        _ => String::new(),
    }
}

fn cluster_op(cluster: &Cluster, cmd: &str) -> String {
    match cmd {
        "show" => make_cluster_blob(cluster),
        "bad" => match cluster.demote_front() {
            Some(proxy) => format!("bad outproxy {}\n", proxy.addr()),
            None => String::new(),
        },
        _ => String::new(),
    }
}

fn api_outproxy(registry: &Registry, api: &[&str]) -> String {
    let [addr, cmd, ..] = api else {
        return String::new();
    };
    let Some(proxy) = registry.find_outproxy(addr) else {
        return String::new();
    };
    match *cmd {
        "bad" => {
            proxy.penalize();
            format!("bad outproxy {}\n", proxy.addr())
        }
        "good" => {
            proxy.clear_bad();
            format!("good outproxy {}\n", proxy.addr())
        }
        _ => String::new(),
    }
}

fn api_block(registry: &Registry, api: &[&str]) -> String {
    match api {
        ["list", ..] => registry
            .block_hosts()
            .iter()
            .map(|b| format!("{b}\n"))
            .collect(),
        [name, rest @ ..] => {
            let Some(block) = registry
                .block_hosts()
                .iter()
                .find(|b| b.pattern().to_string() == *name)
            else {
                return String::new();
            };
            let enable = !matches!(rest.first().copied(), Some("off"));
            block.set_enabled(enable);
            let state = if enable { "on" } else { "off" };
            format!("block {name} {state}\n")
        }
        _ => String::new(),
    }
}
