use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Default)]
pub struct TableMetrics {
    pub writes: Family<WriteLabels, Counter>,
    pub entries: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WriteLabels {
    pub operation: String,
    pub status: String,
}

impl TableMetrics {
    /// Register table metrics to start tracking them.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register(
            "table_writes",
            "Number of egress table writes",
            self.writes.clone(),
        );
        r.register(
            "table_entries",
            "Rows in the node egress table",
            self.entries.clone(),
        );
        self
    }

    pub fn count(&self, operation: &str, status: &str, n: usize) {
        self.writes
            .get_or_create(&WriteLabels {
                operation: operation.into(),
                status: status.into(),
            })
            .inc_by(n as u64);
    }
}
