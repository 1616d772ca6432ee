//! Process-wide coordinator lifecycle
//!
//! Kept in its own test binary because the instance is shared by the whole
//! process.

use async_trait::async_trait;
use bitsync_core::{
    global, init_global, shutdown, Bit, BitBinding, BitTotals, BitTransport, BitsyncError,
    EngineSettings, ProgressSink, TransferSnapshot,
};
use std::sync::Arc;

struct Echo;

#[async_trait]
impl BitTransport for Echo {
    async fn fetch(&self, bit: Bit, progress: ProgressSink) -> anyhow::Result<Vec<Bit>> {
        progress.report(TransferSnapshot::from_totals(
            bit.clone(),
            vec![bit.clone()],
            BitTotals::new(10, 10),
        ));
        Ok(vec![bit])
    }
}

#[tokio::test]
async fn test_global_lifecycle() {
    let settings = EngineSettings {
        throttle_interval_ms: 50,
        ..EngineSettings::default()
    };
    let coordinator = init_global(settings.clone()).unwrap();
    assert_eq!(coordinator.settings().throttle_interval_ms, 50);
    assert!(matches!(
        init_global(settings),
        Err(BitsyncError::InvalidOperation(_))
    ));

    // Two independent surfaces share the same transfers
    let window_a = BitBinding::global();
    let window_b = BitBinding::global();
    window_a.set_backend(Arc::new(Echo));

    let bit = Bit::new("shared")
        .with_link("https://hub.example.com/shared")
        .with_size(10)
        .with_file_name("shared.bin");
    window_a.download(bit, None).await.unwrap();
    assert_eq!(window_b.latest_pct("shared"), Some(100.0));

    shutdown();
    assert_eq!(global().latest_pct("shared"), None);
    assert!(global().active().is_empty());
}
