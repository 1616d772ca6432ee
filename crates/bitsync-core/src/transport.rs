//! Transport seam
//!
//! The coordinator never moves bytes itself. A [`BitTransport`] performs the
//! actual fetch of one bit, reports raw progress through the
//! [`ProgressSink`] it is handed, and resolves to the bits the request
//! expanded into (a multi-file model resolves to several).

use crate::engine::ProgressSink;
use async_trait::async_trait;
use bitsync_types::Bit;

#[async_trait]
pub trait BitTransport: Send + Sync {
    /// Fetch `bit`. Retries, timeouts and persistence are up to the
    /// implementation.
    async fn fetch(&self, bit: Bit, progress: ProgressSink) -> anyhow::Result<Vec<Bit>>;
}
