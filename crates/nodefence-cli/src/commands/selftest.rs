//! Test mode: print one line per check, exit with the failure count.

use nodefence_core::binding::BindingTable;
use nodefence_core::selftest::test_all;

use super::Wiring;

/// Runs every read-only check and prints the report to stdout.
pub fn run(bindings: &BindingTable, wiring: &Wiring) -> u8 {
    let report = test_all(bindings, &wiring.probe, &wiring.backends);
    for line in report.lines() {
        println!("{line}");
    }
    println!("{}", report.summary());
    report.exit_code()
}
