use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    pub port: u16,
    pub host: String,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            port: 29000,
            host: "0.0.0.0".to_string(),
        }
    }
}

pub fn init_metrics() {
    // Tree holder metrics
    describe_gauge!("arbor_tree_holders", "Number of live tree holders");
    describe_counter!(
        "arbor_tree_initializations_total",
        "Total tree holder initial reads completed"
    );
    describe_counter!(
        "arbor_tree_init_timeouts_total",
        "Total tree holder initializations abandoned on timeout"
    );
    describe_counter!(
        "arbor_store_connectivity_events_total",
        "Total coordination store suspend/reconnect/lost events observed"
    );
    describe_counter!(
        "arbor_holders_evicted_total",
        "Total idle tree holders evicted under resource pressure"
    );

    // Route resolution metrics
    describe_counter!(
        "arbor_malformed_documents_total",
        "Total cluster documents that failed to decode"
    );
    describe_counter!(
        "arbor_route_mismatch_total",
        "Total audited lookups whose nominal and resolved names differ"
    );
    describe_counter!(
        "arbor_route_ambiguous_total",
        "Total audited lookups where rewriting would merge distinct clusters"
    );
    describe_counter!(
        "arbor_bad_routes_total",
        "Total watched clusters resolving to an empty destination"
    );

    // Watcher metrics
    describe_counter!(
        "arbor_route_changed_dumps_total",
        "Total full dumps triggered by a route resolution change"
    );
}

pub fn start_prometheus(config: PrometheusConfig) {
    init_metrics();

    let ip_addr: IpAddr = config
        .host
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
    let socket_addr = SocketAddr::new(ip_addr, config.port);

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .upkeep_timeout(Duration::from_secs(5 * 60))
        .install()
        .expect("Failed to install Prometheus metrics exporter");
}
