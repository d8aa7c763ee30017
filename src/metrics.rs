/// Per-entity counters. The entity is never shared without a lock, so these are plain values;
///  [AmMetrics::snapshot] hands out a copy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AmMetrics {
    pub units_submitted: u64,
    pub units_delivered: u64,

    pub data_pdus_sent: u64,
    pub data_bytes_sent: u64,
    pub retransmitted_pdus: u64,
    pub status_pdus_sent: u64,

    pub data_pdus_received: u64,
    pub data_bytes_received: u64,
    pub status_pdus_received: u64,

    pub duplicates: u64,
    pub out_of_window: u64,
    pub malformed: u64,
    pub protocol_anomalies: u64,
    /// unit fragments dropped by reassembly
    pub dropped_fragments: u64,
}

impl AmMetrics {
    pub fn snapshot(&self) -> AmMetrics {
        self.clone()
    }

    /// everything that was received but could not be used
    pub fn discarded_pdus(&self) -> u64 {
        self.duplicates + self.out_of_window + self.malformed + self.protocol_anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discarded_pdus() {
        let metrics = AmMetrics {
            duplicates: 1,
            out_of_window: 2,
            malformed: 3,
            protocol_anomalies: 4,
            dropped_fragments: 100,
            ..AmMetrics::default()
        };
        assert_eq!(metrics.discarded_pdus(), 10);
        assert_eq!(metrics.snapshot(), metrics);
    }
}
