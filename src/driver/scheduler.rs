//! Dependency-ordered top-level schedule.
//!
//! Tests start ready (empty dependency set) or blocked. The scheduler pops
//! one ready test, runs it to completion, and only then continues; a single
//! distributed test still fans out across its allocated workers. A module
//! is satisfied only when every test registered under it reaches PASS; a
//! module with any other outcome permanently blocks its dependents.

use crate::config::SuiteConfig;
use crate::driver;
use crate::registry;
use crate::suite::exec;
use crate::suite::record::{TestKind, TestRecord};
use crate::types::{Result, Status};
use crate::utils::fmt::indent;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Write;

fn run_one(record: &mut TestRecord) -> Result<()> {
    match record.kind {
        TestKind::Distributed => driver::run_distributed(record),
        _ => exec::execute(record, false, false),
    }
}

/// Execute every registered test under the dependency schedule, streaming
/// progress to `out`. Returns `true` when every executed test passed.
///
/// Tests blocked on a module that never gets satisfied are left un-run and
/// do not appear in the tally.
pub fn run_all(config: &SuiteConfig, out: &mut dyn Write) -> Result<bool> {
    driver::start(config)?;

    let mut instances = registry::schedule_snapshot();
    log::info!("suite starting with {} registered tests", instances.len());

    let mut ready: VecDeque<usize> = VecDeque::new();
    let mut blocked: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    let mut remaining: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();

    for (index, test) in instances.iter().enumerate() {
        if test.dependencies.is_empty() {
            ready.push_back(index);
        } else {
            for dep in &test.dependencies {
                blocked.entry(dep.clone()).or_default().push(index);
            }
        }
        remaining
            .entry(test.module().to_string())
            .or_default()
            .insert(index);
    }

    let mut tally: BTreeMap<Status, u32> = BTreeMap::new();
    let mut success = true;
    let mut count: u32 = 0;

    while let Some(index) = ready.pop_front() {
        count += 1;
        let test_name = format!("{}::{}", instances[index].module(), instances[index].name());
        write!(out, "RUNNING TEST #{:<5} {}   ", count, test_name)?;
        out.flush()?;

        run_one(&mut instances[index])?;

        let status = instances[index].status();
        let module = instances[index].module().to_string();

        writeln!(out, "{}", status)?;
        {
            let record = &instances[index];
            for (child, child_status) in record.child_status().iter().enumerate() {
                writeln!(out, "  Child #{}   {}", child + 1, child_status)?;
                let child_report = &record.child_reports()[child];
                if !child_report.is_empty() {
                    writeln!(out, "{}", indent(child_report, 4))?;
                }
            }
            if !record.report().is_empty() {
                writeln!(out, "{}", indent(record.report(), 2))?;
            }
            writeln!(out)?;
        }
        out.flush()?;

        if status == Status::Pass {
            if let Some(module_tests) = remaining.get_mut(&module) {
                module_tests.remove(&index);
                if module_tests.is_empty() {
                    // Entire module satisfied: release everything blocked
                    // on it whose dependency set drains to empty.
                    log::debug!("module {} satisfied", module);
                    if let Some(waiting) = blocked.get(&module) {
                        for &blocked_index in waiting {
                            instances[blocked_index].dependencies.remove(&module);
                            if instances[blocked_index].dependencies.is_empty() {
                                ready.push_back(blocked_index);
                            }
                        }
                    }
                }
            }
        } else {
            success = false;
        }

        *tally.entry(status).or_insert(0) += 1;
    }

    writeln!(out, "{}", "-".repeat(80))?;
    for (status, passed) in &tally {
        writeln!(out, "{}/{} TESTS {}", passed, count, status.past_tense())?;
    }
    out.flush()?;

    driver::shutdown();
    Ok(success)
}
