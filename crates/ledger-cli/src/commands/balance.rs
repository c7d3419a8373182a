//! Balance command

use ledger_core::ReadMode;

use super::{customer_scope, feature_id, Context, Ledger};

pub async fn handle(ctx: &Context, customer: &str, feature: Option<&str>, entity: Option<&str>) -> anyhow::Result<()> {
    let ledger = Ledger::open(ctx).await?;
    let (customer_id, entity_id) = customer_scope(customer, entity)?;

    match feature {
        Some(feature) => {
            let balance = ledger
                .service
                .balance(&customer_id, entity_id.as_ref(), &feature_id(feature)?, ReadMode::SkipCache)
                .await?;
            ctx.format.print(&balance)
        }
        None => {
            let view = ledger
                .service
                .balances(&customer_id, entity_id.as_ref(), ReadMode::SkipCache)
                .await?;
            ctx.format.print(view.as_ref())
        }
    }
}
