//! Detailed per-test report rendering.
//!
//! The report is the string carried by `FinishedTest` frames and attached
//! to every record; outer presentation layers only concatenate it.

use crate::suite::record::TestRecord;
use crate::types::Counter;
use crate::utils::fmt::format_duration;
use serde_json::{json, Map, Value};

fn counter_value(counter: &Counter) -> Value {
    json!({ "size": counter.size, "blocks": counter.count })
}

/// JSON report covering errors, phase timings, and resource activity.
pub(crate) fn detailed(record: &TestRecord) -> String {
    let mut root = Map::new();

    if !record.errors.is_empty() {
        root.insert("errors".to_string(), json!(record.errors));
    }

    let mut time = Map::new();
    if record.init_time > 0 {
        time.insert(
            "initialization".to_string(),
            json!(format_duration(record.init_time)),
        );
    }
    if record.baseline_time > 0 {
        time.insert(
            "baseline".to_string(),
            json!(format_duration(record.baseline_time)),
        );
    }
    time.insert("body".to_string(), json!(format_duration(record.body_time)));
    if record.complete_time > 0 {
        time.insert(
            "cleanup".to_string(),
            json!(format_duration(record.complete_time)),
        );
    }
    root.insert("time".to_string(), Value::Object(time));

    let memory = &record.used.memory;
    if memory.allocate.size > 0 || memory.deallocate.size > 0 || memory.max.size > 0 {
        let mut section = Map::new();
        if memory.allocate.size > 0 {
            section.insert("allocated".to_string(), counter_value(&memory.allocate));
        }
        if memory.deallocate.size > 0 {
            section.insert("freed".to_string(), counter_value(&memory.deallocate));
        }
        if memory.max.size > 0 {
            section.insert("max".to_string(), counter_value(&memory.max));
        }
        root.insert("memory".to_string(), Value::Object(section));
    }

    let network = &record.used.network;
    if network.send.count > 0 || network.receive.count > 0 {
        root.insert(
            "network".to_string(),
            json!({
                "sent": { "size": network.send.size, "packets": network.send.count },
                "received": { "size": network.receive.size, "packets": network.receive.count },
            }),
        );
    }

    serde_json::to_string_pretty(&Value::Object(root)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::record::TestBuilder;

    #[test]
    fn report_includes_errors_and_timings() {
        let _serial = crate::monitor::test_guard();
        crate::registry::clear();
        TestBuilder::unit("report", "t").register();
        let mut record = crate::registry::schedule_snapshot().remove(0);
        crate::registry::clear();

        record.errors.push("something broke".to_string());
        record.init_time = 1_000_000;
        record.body_time = 2_000_000;
        record.used.memory.allocate = Counter { size: 100, count: 2 };
        record.used.memory.max = Counter { size: 100, count: 2 };

        let report = detailed(&record);
        assert!(report.contains("something broke"));
        assert!(report.contains("initialization"));
        assert!(report.contains("\"body\": \"2.00 ms\""));
        assert!(report.contains("allocated"));
        assert!(report.contains("max"));
        assert!(!report.contains("freed"));
        assert!(!report.contains("network"));
    }

    #[test]
    fn quiet_record_reports_only_time() {
        let _serial = crate::monitor::test_guard();
        crate::registry::clear();
        TestBuilder::unit("report", "quiet").register();
        let mut record = crate::registry::schedule_snapshot().remove(0);
        crate::registry::clear();
        record.body_time = 500;

        let report = detailed(&record);
        assert!(report.contains("time"));
        assert!(!report.contains("errors"));
        assert!(!report.contains("memory"));
    }
}
