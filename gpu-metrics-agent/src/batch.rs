//! Per-cycle batch assembly
//!
//! Walks every device and field of a poll result, translates the latest
//! sample of each field and collects the resulting series. The very first
//! poll of the process is dropped: DCGM tends to replay a stale value right
//! after the watch is registered.

use tracing::{debug, error};

use crate::fields::PollResult;
use crate::series::SubmissionBatch;
use crate::translator::{device_labels, Translator};

pub struct BatchBuilder<'a> {
    translator: Translator<'a>,
    polls: u64,
}

impl<'a> BatchBuilder<'a> {
    pub fn new(translator: Translator<'a>) -> Self {
        Self { translator, polls: 0 }
    }

    pub fn translator(&self) -> &Translator<'a> {
        &self.translator
    }

    /// Number of `build` calls so far
    pub fn polls(&self) -> u64 {
        self.polls
    }

    pub fn build(&mut self, poll: &PollResult) -> SubmissionBatch {
        self.polls += 1;
        let mut batch = SubmissionBatch::new();

        if self.polls == 1 {
            debug!("Skipping first poll to avoid duplicate DCGM samples");
            return batch;
        }

        for (device, fields) in poll {
            let labels = device_labels(*device);
            for (field_id, window) in fields {
                // Older entries of the window were covered by previous cycles
                let Some(sample) = window.last() else {
                    continue;
                };
                match self.translator.translate(*field_id, sample, &labels) {
                    Ok(Some(series)) => batch.push(series),
                    Ok(None) => {}
                    Err(e) => error!("Dropping field {} on device {}: {}", field_id, device, e),
                }
            }
        }

        debug!("Built batch of {} series (poll #{})", batch.len(), self.polls);
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MetricCatalog, MetricDefinition, ValueType};
    use crate::fields::{FieldSample, FieldValue};
    use crate::resource::{ResourceIdentity, ResourceType};
    use std::collections::BTreeMap;

    fn catalog() -> MetricCatalog {
        MetricCatalog::new(vec![
            MetricDefinition::gauge(10, "m1", "first", ValueType::Int64, None),
            MetricDefinition::gauge(20, "m2", "second", ValueType::Double, None),
        ])
        .unwrap()
    }

    fn resource() -> ResourceIdentity {
        ResourceIdentity::new(ResourceType::GceInstance, BTreeMap::new())
    }

    fn poll(entries: &[(u32, u16, Vec<FieldSample>)]) -> PollResult {
        let mut result = PollResult::new();
        for (device, field, window) in entries {
            result.entry(*device).or_default().insert(*field, window.clone());
        }
        result
    }

    fn full_poll() -> PollResult {
        poll(&[
            (0, 10, vec![FieldSample::new(FieldValue::Int(1), 1_000_000)]),
            (0, 20, vec![FieldSample::new(FieldValue::Double(0.5), 1_000_000)]),
            (1, 10, vec![FieldSample::new(FieldValue::Int(2), 1_000_000)]),
            (1, 20, vec![FieldSample::new(FieldValue::Double(0.7), 1_000_000)]),
        ])
    }

    #[test]
    fn test_first_poll_is_suppressed() {
        let (catalog, resource) = (catalog(), resource());
        let mut builder = BatchBuilder::new(Translator::new(&catalog, &resource));

        assert!(builder.build(&full_poll()).is_empty());
        assert_eq!(builder.polls(), 1);
        assert_eq!(builder.build(&full_poll()).len(), 4);
    }

    #[test]
    fn test_repeated_polls_do_not_accumulate() {
        let (catalog, resource) = (catalog(), resource());
        let mut builder = BatchBuilder::new(Translator::new(&catalog, &resource));
        builder.build(&full_poll());

        for _ in 0..5 {
            assert_eq!(builder.build(&full_poll()).len(), 4);
        }
        assert_eq!(builder.polls(), 6);
    }

    #[test]
    fn test_only_latest_sample_is_used() {
        let (catalog, resource) = (catalog(), resource());
        let mut builder = BatchBuilder::new(Translator::new(&catalog, &resource));
        builder.build(&PollResult::new());

        let window = vec![
            FieldSample::new(FieldValue::Int(1), 1_000_000),
            FieldSample::new(FieldValue::Int(2), 2_000_000),
            FieldSample::new(FieldValue::Int(3), 3_000_000),
        ];
        let batch = builder.build(&poll(&[(0, 10, window)]));
        assert_eq!(batch.len(), 1);
        let point = &batch.series()[0].points[0];
        assert_eq!(point.value.int64_value(), Some(3));
        assert_eq!(point.end_time.seconds, 3);
    }

    #[test]
    fn test_skips_blank_unknown_empty_and_mismatched_fields() {
        let (catalog, resource) = (catalog(), resource());
        let mut builder = BatchBuilder::new(Translator::new(&catalog, &resource));
        builder.build(&PollResult::new());

        let batch = builder.build(&poll(&[
            (0, 10, vec![FieldSample::blank(1_000_000)]),
            (0, 20, vec![FieldSample::new(FieldValue::Double(0.5), 1_000_000)]),
            (0, 99, vec![FieldSample::new(FieldValue::Int(1), 1_000_000)]),
            (1, 10, vec![]),
            (1, 20, vec![FieldSample::new(FieldValue::Str("bad".into()), 1_000_000)]),
            (2, 10, vec![FieldSample::new(FieldValue::Int(7), 1_000_000)]),
        ]));

        let names: Vec<_> = batch
            .series()
            .iter()
            .map(|s| (s.metric_type.as_str(), s.metric_labels["device"].as_str()))
            .collect();
        assert_eq!(names, vec![("m2", "0"), ("m1", "2")]);
    }
}
