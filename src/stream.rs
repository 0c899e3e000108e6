use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct ChunkBuffer {
    data: Bytes,
}

impl ChunkBuffer {
    pub fn new(chunk_size: usize) -> Self {
        let data: Vec<u8> = (0..chunk_size).map(|i| (i % 256) as u8).collect();
        Self { data: Bytes::from(data) }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn slice(&self, len: usize) -> Bytes {
        self.data.slice(..len)
    }
}

#[derive(Clone, Debug)]
pub struct ChunkPlan {
    remaining: u64,
    chunk: u64,
}

impl ChunkPlan {
    pub fn new(total: u64, chunk: usize) -> Self {
        Self { remaining: total, chunk: chunk as u64 }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Iterator for ChunkPlan {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 || self.chunk == 0 {
            return None;
        }
        let n = self.chunk.min(self.remaining);
        self.remaining -= n;
        Some(n as usize)
    }
}

/// Stream `total` bytes of filler through a channel of `depth` chunks. Dropping
/// the stream closes the channel and the producer stops on its next send.
pub fn payload_stream(
    total: u64,
    buffer: ChunkBuffer,
    depth: usize,
    sent: Arc<AtomicU64>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let (tx, rx) = mpsc::channel::<Bytes>(depth.max(1));

    tokio::spawn(async move {
        let mut plan = ChunkPlan::new(total, buffer.len());
        while let Some(n) = plan.next() {
            if tx.send(buffer.slice(n)).await.is_err() {
                debug!(total, unsent = plan.remaining() + n as u64, "Client went away mid-stream");
                return;
            }
            sent.fetch_add(n as u64, Ordering::Relaxed);
            tokio::task::yield_now().await;
        }
        debug!(total, "Payload fully produced");
    });

    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok(chunk), rx))
    })
}
