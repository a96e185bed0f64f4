//! Basic usage of the pool manager with an in-memory driver

use esox_connpool::{
    BoxError, ConnectionFactory, ConnectionPriority, FixedMemoryProbe, PoolConfiguration, PoolManager,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

struct DemoDriver {
    opened: AtomicUsize,
}

#[derive(Debug)]
struct DemoSession {
    number: usize,
}

#[async_trait::async_trait]
impl ConnectionFactory for DemoDriver {
    type Connection = DemoSession;

    async fn connect(&self, config: &PoolConfiguration) -> Result<DemoSession, BoxError> {
        let number = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        println!("   opening session {} to {}", number, config.connection_target);
        Ok(DemoSession { number })
    }

    async fn ping(&self, _session: &mut DemoSession) -> Result<(), BoxError> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("=== EsoxSolutions.ConnectionPool - Basic Examples ===\n");

    let memory = Arc::new(FixedMemoryProbe::new(40.0));
    let config = PoolConfiguration::new("demo://tenants")
        .with_memory_scaling(6, 20, 85.0)
        .with_min_connections(1)
        .with_swap_grace_period(Duration::from_millis(200));

    let manager = PoolManager::builder(DemoDriver {
        opened: AtomicUsize::new(0),
    })
    .config(config)
    .memory_probe(memory.clone())
    .build()?;

    // Example 1: Checkout and automatic return
    println!("1. Checkout:");
    {
        let session = manager.connect_default().await?;
        println!("   Got session {}", session.number);
    }
    println!("   Idle after return: {}\n", manager.get_metrics().idle_connections);

    // Example 2: Memory pressure shrinks the pool
    println!("2. Memory Pressure:");
    memory.set_mb(120.0);
    let export = manager.connect(ConnectionPriority::high("nightly_export")).await?;
    println!("   Max connections now: {}\n", manager.config().max_connections);

    // Example 3: Critical callers mark capacity as reserved
    println!("3. Priority Reservation:");
    let critical = manager.connect(ConnectionPriority::critical("invoice_close")).await?;
    println!("   Reserved: {}\n", manager.get_metrics().reserved_connections);

    // Example 4: Metrics export
    println!("4. Metrics:");
    print!("{}", manager.export_metrics_prometheus("demo", None));

    drop(export);
    drop(critical);
    manager.shutdown().await;
    Ok(())
}
