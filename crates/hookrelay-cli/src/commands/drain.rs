use anyhow::{Result, bail};
use hookrelay_delivery::{DrainOrchestrator, DrainOutcome, DrainRequest, IdRange};
use tracing::info;

use crate::cli::DrainArgs;
use crate::output::{print_error, print_success, report_table};

impl DrainArgs {
    /// `--min-id` and `--max-id` come as a pair. The orchestrator rejects a
    /// range without `--webhook-id` and an inverted range.
    pub fn to_request(&self) -> Result<DrainRequest> {
        let range = match (self.min_id, self.max_id) {
            (Some(min), Some(max)) => Some(IdRange::new(min, max)),
            (None, None) => None,
            _ => bail!("--min-id and --max-id must be given together"),
        };
        Ok(DrainRequest {
            destination_id: self.webhook_id,
            range,
        })
    }
}

/// Returns `false` when there was nothing eligible to drain.
pub async fn run(orchestrator: &DrainOrchestrator, args: &DrainArgs) -> Result<bool> {
    let request = args.to_request()?;
    match orchestrator.run(request).await? {
        DrainOutcome::NotQueuedMode => {
            info!("Queue mode is not enabled, nothing to drain");
            print_success("Queue mode is not enabled, nothing to drain");
            Ok(true)
        }
        DrainOutcome::NoEligibleDestinations => {
            print_error("No eligible webhooks to process");
            Ok(false)
        }
        DrainOutcome::Completed(report) => {
            println!("{}", report_table(&report));
            if report.time_limit_reached {
                print_success("Drain stopped at the time limit; remaining payloads stay queued");
            } else {
                print_success("Drain finished");
            }
            Ok(true)
        }
    }
}
