use criterion::{Criterion, criterion_group, criterion_main};
use esox_connpool::{BoxError, ConnectionFactory, PoolConfiguration, PoolManager};

struct NullDriver;

#[async_trait::async_trait]
impl ConnectionFactory for NullDriver {
    type Connection = u64;

    async fn connect(&self, _config: &PoolConfiguration) -> Result<u64, BoxError> {
        Ok(0)
    }

    async fn ping(&self, _connection: &mut u64) -> Result<(), BoxError> {
        Ok(())
    }
}

fn checkout_release(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let manager = runtime.block_on(async {
        PoolManager::builder(NullDriver)
            .config(
                PoolConfiguration::new("bench://null")
                    .without_memory_scaling()
                    .with_health_checks(false)
                    .with_idle_cleanup(false),
            )
            .build()
            .unwrap()
    });

    c.bench_function("checkout_release", |b| {
        b.to_async(&runtime).iter(|| async {
            let mut conn = manager.connect_default().await.unwrap();
            *conn += 1;
        })
    });

    c.bench_function("get_metrics", |b| b.iter(|| manager.get_metrics()));
}

criterion_group!(benches, checkout_release);
criterion_main!(benches);
