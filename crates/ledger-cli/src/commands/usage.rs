//! Mutating commands: track, credit, set

use ledger_core::{CreditKind, CreditRequest, UsageEvent};
use rust_decimal::Decimal;
use serde::Serialize;

use super::{customer_scope, feature_id, Context, Ledger};

/// Command result plus the number of background jobs it triggered
#[derive(Debug, Serialize)]
pub struct Report<T> {
    #[serde(flatten)]
    pub result: T,
    pub jobs_run: usize,
}

pub async fn track(
    ctx: &Context,
    customer: &str,
    feature: &str,
    entity: Option<&str>,
    amount: Decimal,
) -> anyhow::Result<()> {
    let ledger = Ledger::open(ctx).await?;
    let (customer_id, entity_id) = customer_scope(customer, entity)?;
    let mut event = UsageEvent::new(customer_id, feature_id(feature)?, amount);
    if let Some(entity_id) = entity_id {
        event = event.for_entity(entity_id);
    }

    let receipt = ledger.service.track(event).await?;
    let jobs_run = ledger.drain_jobs().await;
    ledger.save(ctx)?;
    ctx.format.print(&Report {
        result: receipt,
        jobs_run,
    })
}

pub async fn credit(
    ctx: &Context,
    customer: &str,
    feature: &str,
    entity: Option<&str>,
    amount: Decimal,
    kind: CreditKind,
) -> anyhow::Result<()> {
    let ledger = Ledger::open(ctx).await?;
    let (customer_id, entity_id) = customer_scope(customer, entity)?;
    let request = CreditRequest {
        customer_id,
        entity_id,
        feature_id: feature_id(feature)?,
        amount,
        kind,
    };

    let receipt = ledger.service.credit(request).await?;
    let jobs_run = ledger.drain_jobs().await;
    ledger.save(ctx)?;
    ctx.format.print(&Report {
        result: receipt,
        jobs_run,
    })
}

pub async fn set(
    ctx: &Context,
    customer: &str,
    feature: &str,
    entity: Option<&str>,
    target: Decimal,
) -> anyhow::Result<()> {
    let ledger = Ledger::open(ctx).await?;
    let (customer_id, entity_id) = customer_scope(customer, entity)?;
    let receipt = ledger
        .service
        .set_balance(&customer_id, entity_id.as_ref(), &feature_id(feature)?, target)
        .await?;
    let jobs_run = ledger.drain_jobs().await;
    ledger.save(ctx)?;
    ctx.format.print(&Report {
        result: receipt,
        jobs_run,
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::seeded;
    use super::*;
    use ledger_common::{CustomerId, FeatureId};
    use ledger_core::ReadMode;

    #[tokio::test]
    async fn test_report_flattens_receipt() {
        let ledger = seeded().await;
        let receipt = ledger
            .service
            .track(UsageEvent::new(
                CustomerId::new("cus_1").unwrap(),
                FeatureId::new("messages").unwrap(),
                Decimal::from(5),
            ))
            .await
            .unwrap();
        let value = serde_json::to_value(Report {
            result: receipt,
            jobs_run: 0,
        })
        .unwrap();
        assert_eq!(value["customer_id"], "cus_1");
        assert_eq!(value["jobs_run"], 0);
    }

    #[tokio::test]
    async fn test_set_then_read() {
        let ledger = seeded().await;
        let customer = CustomerId::new("cus_1").unwrap();
        let feature = FeatureId::new("messages").unwrap();
        let receipt = ledger
            .service
            .set_balance(&customer, None, &feature, Decimal::from(40))
            .await
            .unwrap();
        assert_eq!(receipt.previous, Decimal::from(100));
        assert_eq!(receipt.balance, Decimal::from(40));
        let balance = ledger
            .service
            .balance(&customer, None, &feature, ReadMode::SkipCache)
            .await
            .unwrap();
        assert_eq!(balance.current, Decimal::from(40));
    }
}
