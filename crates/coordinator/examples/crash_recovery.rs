//! Crash recovery walkthrough
//!
//! A transaction spans two resource managers. The commit decision reaches
//! the journal, but one resource manager is unreachable during phase two.
//! A second coordinator instance, opened on the same journal, finishes the
//! transaction during startup recovery.
//!
//! Run with: cargo run -p tandem-coordinator --example crash_recovery
//! (set RUST_LOG=debug to see every branch transition)

use std::env;
use std::sync::Arc;
use tandem_common::XaError;
use tandem_coordinator::{CoordinatorConfig, ResourceRegistrar, TransactionManager};
use tandem_journal::JournalConfig;
use tandem_mock_resource::{Behaviour, MockProducer, MockResourceManager, Operation};
use tracing_subscriber::EnvFilter;

async fn coordinator(
    config: &CoordinatorConfig,
    producers: &[Arc<MockProducer>],
) -> Result<Arc<TransactionManager>, Box<dyn std::error::Error>> {
    let registrar = Arc::new(ResourceRegistrar::new());
    for producer in producers {
        registrar.register(producer.clone()).await?;
    }
    Ok(TransactionManager::with_disk_journal(
        config.clone(),
        registrar,
    )?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dir = env::temp_dir().join(format!("tandem-demo-{}", uuid::Uuid::new_v4()));
    let config = CoordinatorConfig {
        journal: JournalConfig::new(dir.clone()),
        ..Default::default()
    };

    // Resource managers outlive coordinator restarts.
    let orders = MockResourceManager::new("orders-db");
    let stock = MockResourceManager::new("stock-db");
    stock.script_times(
        Operation::Commit,
        Behaviour::Fail(XaError::Unavailable("connection refused".to_string())),
        config.commit_retry.max_attempts as usize,
    );

    println!("=== First run ===");
    let id = {
        let producers = [
            Arc::new(MockProducer::new("orders", orders.clone())),
            Arc::new(MockProducer::new("stock", stock.clone())),
        ];
        let manager = coordinator(&config, &producers).await?;
        manager.start().await?;

        let txn = manager.begin()?;
        for producer in &producers {
            manager.enlist(&txn, &producer.connection()).await?;
        }
        match manager.commit(&txn).await {
            Ok(()) => println!("transaction {} committed", txn.id()),
            Err(e) => println!("transaction {} needs recovery: {}", txn.id(), e),
        }
        println!(
            "orders committed: {}, stock in doubt: {}",
            orders.committed().len(),
            stock.in_doubt().len()
        );
        manager.shutdown().await?;
        txn.id()
    };

    println!("\n=== Restart ===");
    let producers = [
        Arc::new(MockProducer::new("orders", orders.clone())),
        Arc::new(MockProducer::new("stock", stock.clone())),
    ];
    let manager = coordinator(&config, &producers).await?;
    let report = manager.start().await?;

    println!(
        "recovered {}: committed {:?}, unresolved {:?}",
        id,
        report.committed,
        report.unresolved()
    );
    println!(
        "orders committed: {}, stock committed: {}",
        orders.committed().len(),
        stock.committed().len()
    );

    manager.shutdown().await?;
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
