//! Process-wide test registry, keyed by module.
//!
//! Builders register clean record templates during process initialization.
//! Both the driver's scheduler and every worker consult the same registry;
//! workers inherit it through the fork that created them, so a dispatched
//! `(module, name)` lookup resolves to the same test everywhere.

use crate::monitor::lock_unpoisoned;
use crate::suite::record::TestRecord;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

static TESTS: Mutex<BTreeMap<String, Vec<TestRecord>>> = Mutex::new(BTreeMap::new());
static MODULE_DEPS: Mutex<BTreeMap<String, BTreeSet<String>>> = Mutex::new(BTreeMap::new());

/// Install a record template. Identity is `(module, name)`; re-registering
/// the same identity replaces the previous template.
pub(crate) fn register(record: TestRecord) {
    let mut tests = lock_unpoisoned(&TESTS);
    let entries = tests.entry(record.module().to_string()).or_default();
    if let Some(existing) = entries
        .iter_mut()
        .find(|t| t.name() == record.name())
    {
        log::warn!(
            "replacing already-registered test {}::{}",
            record.module(),
            record.name()
        );
        *existing = record;
    } else {
        entries.push(record);
    }
}

/// Module-wide dependency declaration builder; see [`declare_module`].
pub struct ModuleBuilder {
    module: String,
}

impl ModuleBuilder {
    /// Every test registered under this module additionally depends on the
    /// named modules.
    pub fn depends_on<I, S>(self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock_unpoisoned(&MODULE_DEPS)
            .entry(self.module.clone())
            .or_default()
            .extend(modules.into_iter().map(Into::into));
        self
    }
}

/// Declare module-level metadata.
pub fn declare_module(name: impl Into<String>) -> ModuleBuilder {
    ModuleBuilder {
        module: name.into(),
    }
}

fn merge_module_deps(record: &mut TestRecord) {
    let deps = lock_unpoisoned(&MODULE_DEPS);
    if let Some(extra) = deps.get(record.module()) {
        for dep in extra {
            record.dependencies.insert(dep.clone());
        }
    }
}

/// Copy of the named template with module dependencies merged, ready to
/// execute. `None` when the identity is unknown.
pub(crate) fn lookup(module: &str, name: &str) -> Option<TestRecord> {
    let tests = lock_unpoisoned(&TESTS);
    let mut record = tests
        .get(module)?
        .iter()
        .find(|t| t.name() == name)?
        .clone();
    drop(tests);
    merge_module_deps(&mut record);
    Some(record)
}

/// Fresh copies of every enabled template, module dependencies merged, in
/// deterministic module order. Each call yields clean `Pending` records.
pub(crate) fn schedule_snapshot() -> Vec<TestRecord> {
    let tests = lock_unpoisoned(&TESTS);
    let mut snapshot: Vec<TestRecord> = tests
        .values()
        .flatten()
        .filter(|t| t.options.enabled)
        .cloned()
        .collect();
    drop(tests);
    for record in &mut snapshot {
        merge_module_deps(record);
    }
    snapshot
}

/// Remove every registered test and module declaration.
///
/// Intended for test code that builds multiple suites inside one process.
pub fn clear() {
    lock_unpoisoned(&TESTS).clear();
    lock_unpoisoned(&MODULE_DEPS).clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::record::TestBuilder;
    use crate::types::Status;

    #[test]
    fn lookup_returns_clean_copies_with_module_deps() {
        let _serial = crate::monitor::test_guard();
        clear();
        declare_module("reg-b").depends_on(["reg-a"]);
        TestBuilder::unit("reg-b", "t1")
            .depends_on(["reg-c"])
            .body(|| {})
            .register();

        let record = lookup("reg-b", "t1").expect("registered test");
        assert_eq!(record.status(), Status::Pending);
        assert!(record.dependencies.contains("reg-a"));
        assert!(record.dependencies.contains("reg-c"));

        assert!(lookup("reg-b", "missing").is_none());
        assert!(lookup("missing", "t1").is_none());
        clear();
    }

    #[test]
    fn snapshot_skips_disabled_tests() {
        let _serial = crate::monitor::test_guard();
        clear();
        TestBuilder::unit("reg-snap", "on").body(|| {}).register();
        TestBuilder::unit("reg-snap", "off")
            .body(|| {})
            .disable()
            .register();

        let snapshot = schedule_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name(), "on");
        clear();
    }

    #[test]
    fn reregistration_replaces_the_template() {
        let _serial = crate::monitor::test_guard();
        clear();
        TestBuilder::unit("reg-dup", "t").timeout_millis(1).register();
        TestBuilder::unit("reg-dup", "t").timeout_millis(2).register();

        let record = lookup("reg-dup", "t").expect("registered test");
        assert_eq!(record.options.timeout_ns, 2_000_000);
        let snapshot = schedule_snapshot();
        assert_eq!(snapshot.len(), 1);
        clear();
    }
}
