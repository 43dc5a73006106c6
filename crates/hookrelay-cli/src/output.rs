use colored::Colorize;
use hookrelay_delivery::{Banner, DrainReport, TestSendOutcome};
use tabled::builder::Builder;
use tabled::settings::Style;

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "!".yellow(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

pub fn print_banner(outcome: &TestSendOutcome) {
    match outcome.banner {
        Banner::Success => print_success(&outcome.message),
        Banner::Warning => print_warning(&outcome.message),
        Banner::Error => print_error(&outcome.message),
    }
}

pub fn report_table(report: &DrainReport) -> String {
    let mut builder = Builder::default();
    builder.push_record(["Destinations", "Batches", "Delivered", "Failed", "Dropped", "Unpublished"]);
    builder.push_record([
        report.destinations.to_string(),
        report.batches.to_string(),
        report.delivered.to_string(),
        report.failed.to_string(),
        report.dropped.to_string(),
        report.disabled.to_string(),
    ]);
    builder.build().with(Style::rounded()).to_string()
}
