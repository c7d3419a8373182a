//! Reset sweep command

use tracing::info;

use super::{Context, Ledger};

pub async fn handle(ctx: &Context) -> anyhow::Result<()> {
    let ledger = Ledger::open(ctx).await?;
    let report = ledger.service.scheduler().sweep().await?;
    info!(
        customers = report.customers,
        grants_reset = report.grants_reset,
        "sweep finished"
    );
    ledger.save(ctx)?;
    ctx.format.print(&report)
}

#[cfg(test)]
mod tests {
    use super::super::tests::seeded;

    #[tokio::test]
    async fn test_sweep_without_due_grants_is_empty() {
        let ledger = seeded().await;
        let report = ledger.service.scheduler().sweep().await.unwrap();
        assert_eq!(report.grants_reset, 0);
        assert_eq!(report.failed, 0);
    }
}
