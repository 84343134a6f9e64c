//! Two services in one process talking through an in-memory discovery uplink.
//!
//! Run with: cargo run -p mdk-demo
//!
//! Set `RUST_LOG=debug` to see uplink and resolution traffic.

use std::{sync::Arc, time::Duration};

use futures::FutureExt;
use mdk_session::{Mdk, MdkConfig, MdkError, MemoryUplink, Session, TracingSink};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let directory = MemoryUplink::new();
    let config = MdkConfig::from_env()?;

    let inventory = Mdk::new(config.clone(), Arc::new(directory.clone()));
    inventory.start().await?;
    inventory.register("inventory", "2.1", "127.0.0.1:7001")?;

    let storefront = Mdk::new(config, Arc::new(directory.clone()));
    storefront.start().await?;

    let mut sink = TracingSink;
    let mut session = storefront.session();
    tracing::info!(trace_id = %session.trace_id(), "Handling checkout");

    let token = session
        .interact_async(|s| {
            async move {
                s.info("checkout", "looking up inventory");
                let node = s.resolve_until("inventory", "^2.0", Duration::from_secs(2)).await?;
                s.info("checkout", format!("calling inventory at {}", node.address));
                Ok::<_, MdkError>(s.inject())
            }
            .boxed()
        })
        .await?;

    // The inventory service continues the trace from the propagated token.
    let mut remote = inventory.join(&token)?;
    reserve_stock(&mut remote, 3);
    remote.flush(&mut sink);

    // Nobody provides shipping, so this interaction fails with a timeout.
    let shipping = session.interact_async(|s| {
        async move { s.resolve_until("shipping", "1.0", Duration::from_millis(200)).await }.boxed()
    });
    if let Err(e) = shipping.await {
        tracing::warn!(error = %e, "Shipping unavailable");
    }

    let report = session.report();
    println!("{}", serde_json::to_string_pretty(&report)?);
    session.flush(&mut sink);

    storefront.stop().await;
    inventory.stop().await;
    Ok(())
}

fn reserve_stock(session: &mut Session, quantity: u32) {
    let result = session.interact(|s| {
        s.info("inventory", format!("reserving {quantity} units"));
        if quantity > 2 {
            return Err(anyhow::anyhow!("only 2 units in stock, {quantity} requested"));
        }
        Ok(())
    });
    if let Err(e) = result {
        tracing::warn!(path = ?session.causal_path(), error = %e, "Reservation failed");
    }
}
