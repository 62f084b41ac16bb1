// Copyright 2025 tsumiki
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The bounded pool of writer actors shared by every upload. A writer
//! accepts one block job at a time, performs the blocking put off the
//! runtime, and acks into the owning session's event queue. Sessions take
//! whole writers from the pool and give them back when they end; a writer
//! handed back with a job still in flight finishes that job for the old
//! session before serving the next.

use std::sync::Arc;

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use snafu::ResultExt;
use tokio::sync::{mpsc, Notify};
use tokio::task::spawn_blocking;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};
use tsumiki_common::WriterId;
use tsumiki_storage::Backend;
use tsumiki_types::BlockKey;

use crate::err::{Result, StorageSnafu, UploadFailedSnafu};
use crate::session::Event;

/// One block write handed to a writer. The ack sender points back at the
/// session the job belongs to.
pub(crate) struct WriteJob {
    pub block: BlockKey,
    pub bucket: Bytes,
    pub data: Bytes,
    pub ack: mpsc::Sender<Event>,
}

/// Handle to one pooled writer actor.
#[derive(Debug)]
pub struct Writer {
    pub(crate) id: WriterId,
    pub(crate) job_tx: mpsc::Sender<WriteJob>,
}

impl Writer {
    pub fn id(&self) -> WriterId {
        self.id
    }

    /// False when the writer task is gone and the job was not accepted.
    pub(crate) async fn submit(&self, job: WriteJob) -> bool {
        self.job_tx.send(job).await.is_ok()
    }
}

struct WriterTask {
    id: WriterId,
    backend: Arc<Backend>,
    rx: mpsc::Receiver<WriteJob>,
    cancel: CancellationToken,
}

impl WriterTask {
    async fn run(mut self) {
        debug!("writer {} started", self.id);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("writer {} cancelled", self.id);
                    return;
                }
                job = self.rx.recv() => {
                    match job {
                        Some(job) => self.exec(job).await,
                        None => return,
                    }
                }
            }
        }
    }

    async fn exec(&self, job: WriteJob) {
        let backend = self.backend.clone();
        let block = job.block;
        let bucket = job.bucket.clone();
        let data = job.data.clone();
        let result: Result<()> = match spawn_blocking(move || {
            backend.layout().put_block(&bucket, &block, &data, false)
        })
        .await
        {
            Ok(io) => io.context(StorageSnafu),
            Err(join) => UploadFailedSnafu {
                reason: format!("writer task panicked: {join}"),
            }
            .fail(),
        };

        if let Err(ref e) = result {
            warn!("writer {} failed to write block {}: {e}", self.id, job.block);
        }
        let acked = job
            .ack
            .send(Event::BlockWritten {
                block_number: job.block.number,
                writer_id: self.id,
                len: job.data.len(),
                result,
            })
            .await;
        if acked.is_err() {
            debug!(
                "writer {}: session gone before ack of block {}",
                self.id, job.block
            );
        }
    }
}

/// Fixed-size free list of writers. Acquisition waits until another upload
/// gives a writer back.
pub struct WriterPool {
    queue: ArrayQueue<Writer>,
    notify: Notify,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl WriterPool {
    pub fn new(backend: Arc<Backend>, size: usize) -> Arc<Self> {
        assert!(size > 0, "writer pool must hold at least one writer");
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let queue = ArrayQueue::new(size);
        for id in 0..size {
            let (job_tx, rx) = mpsc::channel(4);
            tracker.spawn(
                WriterTask {
                    id,
                    backend: backend.clone(),
                    rx,
                    cancel: cancel.child_token(),
                }
                .run(),
            );
            queue
                .push(Writer { id, job_tx })
                .expect("queue sized for every writer");
        }
        tracker.close();
        Arc::new(Self {
            queue,
            notify: Notify::new(),
            cancel,
            tracker,
        })
    }

    pub async fn acquire(self: &Arc<Self>) -> Writer {
        loop {
            if let Some(writer) = self.queue.pop() {
                return writer;
            }
            self.notify.notified().await;
        }
    }

    pub async fn acquire_many(self: &Arc<Self>, n: usize) -> Vec<Writer> {
        let mut writers = Vec::with_capacity(n);
        for _ in 0..n {
            writers.push(self.acquire().await);
        }
        writers
    }

    pub fn release(&self, writer: Writer) {
        if self.queue.push(writer).is_err() {
            // double release; drop the duplicate handle
            warn!("writer released into a full pool");
            return;
        }
        self.notify.notify_one();
    }

    pub fn available(&self) -> usize {
        self.queue.len()
    }

    /// Stops every writer task. Outstanding jobs already picked up run to
    /// completion first.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tracker.wait().await;
    }
}
