use anyhow::Result;
use hookrelay_delivery::DeliveryQueueStorage;

use crate::context::AppContext;
use crate::output::print_success;

pub async fn run(ctx: &AppContext, webhook_id: i64) -> Result<bool> {
    let removed = ctx.storage.purge_destination(webhook_id).await?;
    print_success(&format!(
        "Removed {removed} queued payload(s) of webhook {webhook_id}"
    ));
    Ok(true)
}
