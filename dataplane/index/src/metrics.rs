use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        gauge::Gauge,
        histogram::{exponential_buckets, Histogram},
    },
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct DataplaneMetrics {
    acl_rule_exec_time: Histogram,
    ipsets: Gauge,
    policies: Gauge,
    flushes: Family<FlushLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FlushLabels {
    result: &'static str,
}

impl DataplaneMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        // Programming a policy ranges from about a millisecond to several seconds.
        let acl_rule_exec_time = Histogram::new(exponential_buckets(0.001, 2.0, 14));
        reg.register_with_unit(
            "acl_rule_exec_time",
            "Time taken to accept a policy's ACL rules",
            Unit::Seconds,
            acl_rule_exec_time.clone(),
        );

        let ipsets = Gauge::default();
        reg.register("ipsets", "Number of cached IP sets", ipsets.clone());

        let policies = Gauge::default();
        reg.register(
            "policies",
            "Number of cached network policies",
            policies.clone(),
        );

        let flushes = Family::default();
        reg.register(
            "flushes",
            "Count of dataplane flushes by result",
            flushes.clone(),
        );

        Self {
            acl_rule_exec_time,
            ipsets,
            policies,
            flushes,
        }
    }

    pub(crate) fn record_acl_rule_exec_time(&self, start: time::Instant) {
        self.acl_rule_exec_time
            .observe(start.elapsed().as_secs_f64());
    }

    pub(crate) fn set_sizes(&self, ipsets: usize, policies: usize) {
        self.ipsets.set(ipsets as i64);
        self.policies.set(policies as i64);
    }

    pub(crate) fn flushed(&self, result: &'static str) {
        self.flushes.get_or_create(&FlushLabels { result }).inc();
    }
}
