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

//! Per-upload coordinator. Each upload runs as one actor consuming a
//! serialized event queue: chunks from the caller, write acks from the
//! writers, ticks from the manifest timer. Within one upload there is no
//! shared mutable state; writers communicate by message only.
//!
//! Only `write` may suspend its caller: its reply is withheld while the
//! in-flight buffer is over budget (backpressure) and released by the next
//! write ack that brings the buffer back under. `finalize` replies once
//! every dispatched block has been acked.

use std::collections::{BTreeMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};
use tsumiki_common::{BlockNumber, WriterId};
use tsumiki_storage::Backend;
use tsumiki_types::{BlockKey, Manifest};
use uuid::Uuid;

use crate::config::UploadConfig;
use crate::err::{
    ConfigSnafu, FinalizePendingSnafu, NotFinishedSnafu, Result, TooManyBytesSnafu,
    UnexpectedChunkSnafu, UploadCancelledSnafu, UploadFailedSnafu,
};
use crate::slicer::BlockSlicer;
use crate::writer::{WriteJob, Writer, WriterPool};

/// External collaborator that records upload manifests; persistence happens
/// off the session actor and failures are logged, never fatal.
#[async_trait]
pub trait ManifestSink: Send + Sync + 'static {
    async fn save_manifest(&self, manifest: Manifest) -> Result<()>;
}

/// Identity and shape of one upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub bucket: Bytes,
    pub key: Vec<u8>,
    pub uuid: Uuid,
    pub content_length: u64,
    pub content_type: Option<String>,
}

pub(crate) enum Event {
    AugmentData {
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    BlockWritten {
        block_number: BlockNumber,
        writer_id: WriterId,
        len: usize,
        result: Result<()>,
    },
    Finalize {
        reply: oneshot::Sender<Result<Manifest>>,
    },
    ManifestTick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotFull,
    Full,
    AllReceived,
    Done,
    Failed,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::NotFull => "not_full",
            State::Full => "full",
            State::AllReceived => "all_received",
            State::Done => "done",
            State::Failed => "failed",
        }
    }
}

/// Caller-side handle. Dropping it cancels the upload; writers are
/// reclaimed without waiting for their outstanding I/O, which may still
/// land on disk and is not rolled back.
pub struct UploadHandle {
    event_tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
}

impl UploadHandle {
    /// Streams one chunk. Suspends through backpressure; the reply lands
    /// once the chunk is buffered and the buffer is back under budget.
    pub async fn write(&self, data: Bytes) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.event_tx
            .send(Event::AugmentData { data, reply })
            .await
            .map_err(|_| UploadCancelledSnafu.build())?;
        rx.await.map_err(|_| UploadCancelledSnafu.build())?
    }

    /// Resolves once every block is durable, with the final manifest.
    pub async fn finalize(&self) -> Result<Manifest> {
        let (reply, rx) = oneshot::channel();
        self.event_tx
            .send(Event::Finalize { reply })
            .await
            .map_err(|_| UploadCancelledSnafu.build())?;
        rx.await.map_err(|_| UploadCancelledSnafu.build())?
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for UploadHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct UploadSession {
    state: State,
    bucket: Bytes,
    uuid: Uuid,
    slicer: BlockSlicer,
    next_block: BlockNumber,
    /// Sliced blocks waiting for a writer, FIFO in arrival order.
    pending: VecDeque<(BlockNumber, Bytes)>,
    free_writers: BTreeMap<WriterId, Writer>,
    busy_writers: BTreeMap<WriterId, Writer>,
    /// Dispatched blocks not yet acked, keyed by block number.
    unacked: BTreeMap<BlockNumber, usize>,
    current_buffer: usize,
    max_buffer: usize,
    deferred_write: Option<oneshot::Sender<Result<()>>>,
    deferred_finalize: Option<oneshot::Sender<Result<Manifest>>>,
    manifest: Manifest,
    sink: Arc<dyn ManifestSink>,
    pool: Arc<WriterPool>,
    event_tx: mpsc::Sender<Event>,
    ticker_cancel: CancellationToken,
    tasks: TaskTracker,
    failure: Option<String>,
}

impl UploadSession {
    /// The one-shot `prepare` step: takes writers from the pool (may wait
    /// for another upload to give some back), starts the manifest ticker,
    /// and spawns the session actor.
    pub async fn spawn(
        request: UploadRequest,
        backend: Arc<Backend>,
        pool: Arc<WriterPool>,
        sink: Arc<dyn ManifestSink>,
        config: &UploadConfig,
    ) -> Result<UploadHandle> {
        config.validate()?;
        if config.max_buffer_size.as_bytes_usize() < backend.block_size() {
            // a buffer smaller than one block could stall backpressure with
            // nothing in flight to release it
            return ConfigSnafu {
                reason: format!(
                    "max_buffer_size {} is smaller than the block size {}",
                    config.max_buffer_size,
                    backend.block_size()
                ),
            }
            .fail();
        }
        let writers = pool.acquire_many(config.writers_per_upload).await;
        let (event_tx, event_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let ticker_cancel = cancel.child_token();
        let tasks = TaskTracker::new();

        let manifest = Manifest::new(
            request.bucket.to_vec(),
            request.key,
            request.uuid,
            request.content_length,
            request.content_type,
            backend.block_size(),
        );

        spawn_ticker(
            &tasks,
            event_tx.clone(),
            config.manifest_save_interval,
            ticker_cancel.clone(),
        );

        let mut session = UploadSession {
            state: State::NotFull,
            bucket: request.bucket,
            uuid: request.uuid,
            slicer: BlockSlicer::new(backend.block_size(), request.content_length),
            next_block: 0,
            pending: VecDeque::new(),
            free_writers: writers.into_iter().map(|w| (w.id(), w)).collect(),
            busy_writers: BTreeMap::new(),
            unacked: BTreeMap::new(),
            current_buffer: 0,
            max_buffer: config.max_buffer_size.as_bytes_usize(),
            deferred_write: None,
            deferred_finalize: None,
            manifest,
            sink,
            pool,
            event_tx: event_tx.clone(),
            ticker_cancel,
            tasks,
            failure: None,
        };
        if request.content_length == 0 {
            // nothing will ever arrive; the upload is born finished
            session.state = State::Done;
            session.manifest.done = true;
        }

        tokio::spawn(session.run(event_rx, cancel.clone()));
        Ok(UploadHandle { event_tx, cancel })
    }

    async fn run(mut self, mut event_rx: mpsc::Receiver<Event>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("upload {} cancelled in state {}", self.uuid, self.state.name());
                    self.cancel_deferred();
                    break;
                }
                event = event_rx.recv() => {
                    match event {
                        Some(event) => {
                            if self.handle(event).await.is_break() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        self.teardown();
    }

    pub(crate) async fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::AugmentData { data, reply } => self.on_augment_data(data, reply).await,
            Event::BlockWritten {
                block_number,
                writer_id,
                len,
                result,
            } => self.on_block_written(block_number, writer_id, len, result).await,
            Event::Finalize { reply } => self.on_finalize(reply),
            Event::ManifestTick => {
                self.on_manifest_tick();
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_augment_data(
        &mut self,
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    ) -> ControlFlow<()> {
        match self.state {
            State::NotFull => {}
            State::Failed => {
                let _ = reply.send(self.failure_error());
                return ControlFlow::Continue(());
            }
            state => {
                let _ = reply.send(UnexpectedChunkSnafu { state: state.name() }.fail());
                return ControlFlow::Continue(());
            }
        }

        let received = self.slicer.bytes_received();
        let content_length = self.manifest.content_length;
        let chunk = data.len() as u64;
        if received + chunk > content_length {
            let _ = reply.send(
                TooManyBytesSnafu {
                    received,
                    chunk,
                    content_length,
                }
                .fail(),
            );
            return ControlFlow::Continue(());
        }

        let last_chunk = received + chunk == content_length;
        let backpressure = !last_chunk && self.current_buffer + data.len() > self.max_buffer;

        self.slicer.push(&data);
        self.current_buffer += data.len();
        self.manifest.bytes_received = self.slicer.bytes_received();
        for block in self.slicer.drain_blocks() {
            let number = self.next_block;
            self.next_block += 1;
            self.pending.push_back((number, block));
        }
        self.dispatch().await;

        if last_chunk {
            self.state = State::AllReceived;
            let _ = reply.send(Ok(()));
        } else if backpressure {
            debug!(
                "upload {} buffer at {}/{}, deferring caller",
                self.uuid, self.current_buffer, self.max_buffer
            );
            self.deferred_write = Some(reply);
            self.state = State::Full;
        } else {
            let _ = reply.send(Ok(()));
        }
        ControlFlow::Continue(())
    }

    async fn on_block_written(
        &mut self,
        block_number: BlockNumber,
        writer_id: WriterId,
        len: usize,
        result: Result<()>,
    ) -> ControlFlow<()> {
        self.unacked.remove(&block_number);
        self.current_buffer = self.current_buffer.saturating_sub(len);

        if let Some(writer) = self.busy_writers.remove(&writer_id) {
            if self.state == State::Failed {
                self.pool.release(writer);
            } else {
                self.free_writers.insert(writer_id, writer);
            }
        }

        match result {
            Err(e) => {
                if self.state != State::Failed {
                    self.fail(format!("block {block_number}: {e}"));
                }
                ControlFlow::Continue(())
            }
            Ok(()) => {
                if self.state == State::Failed {
                    return ControlFlow::Continue(());
                }
                self.manifest.blocks_written += 1;
                self.dispatch().await;

                match self.state {
                    State::Full => {
                        if self.current_buffer < self.max_buffer {
                            if let Some(reply) = self.deferred_write.take() {
                                let _ = reply.send(Ok(()));
                            }
                            self.state = State::NotFull;
                        }
                        ControlFlow::Continue(())
                    }
                    State::AllReceived => {
                        if self.unacked.is_empty() && self.pending.is_empty() {
                            self.become_done()
                        } else {
                            ControlFlow::Continue(())
                        }
                    }
                    _ => ControlFlow::Continue(()),
                }
            }
        }
    }

    fn on_finalize(&mut self, reply: oneshot::Sender<Result<Manifest>>) -> ControlFlow<()> {
        match self.state {
            State::Done => {
                let _ = reply.send(Ok(self.manifest.clone()));
                ControlFlow::Break(())
            }
            State::AllReceived => {
                if self.deferred_finalize.is_some() {
                    let _ = reply.send(FinalizePendingSnafu.fail());
                } else {
                    self.deferred_finalize = Some(reply);
                }
                ControlFlow::Continue(())
            }
            State::NotFull | State::Full => {
                let _ = reply.send(NotFinishedSnafu.fail());
                ControlFlow::Continue(())
            }
            State::Failed => {
                let _ = reply.send(self.failure_error());
                ControlFlow::Continue(())
            }
        }
    }

    /// Persistence is delegated and detached; a slow or failing sink never
    /// stalls the event loop.
    fn on_manifest_tick(&self) {
        let manifest = self.manifest.clone();
        let sink = self.sink.clone();
        let uuid = self.uuid;
        self.tasks.spawn(async move {
            if let Err(e) = sink.save_manifest(manifest).await {
                warn!("upload {uuid}: manifest save failed: {e}");
            }
        });
    }

    /// Pairs the lowest-id free writer with the lowest queued block until
    /// one side runs out.
    async fn dispatch(&mut self) {
        while !self.pending.is_empty() {
            let Some((writer_id, writer)) = self.free_writers.pop_first() else {
                break;
            };
            let Some((number, data)) = self.pending.pop_front() else {
                self.free_writers.insert(writer_id, writer);
                break;
            };
            let job = WriteJob {
                block: BlockKey::new(self.uuid, number),
                bucket: self.bucket.clone(),
                data: data.clone(),
                ack: self.event_tx.clone(),
            };
            if writer.submit(job).await {
                self.unacked.insert(number, data.len());
                self.busy_writers.insert(writer_id, writer);
            } else {
                self.fail(format!("writer {writer_id} is gone"));
                return;
            }
        }
    }

    fn become_done(&mut self) -> ControlFlow<()> {
        debug!(
            "upload {} complete: {} blocks",
            self.uuid, self.manifest.blocks_written
        );
        self.state = State::Done;
        self.manifest.done = true;
        if let Some(reply) = self.deferred_finalize.take() {
            let _ = reply.send(Ok(self.manifest.clone()));
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    /// Writer failure policy: the upload fails as a whole. The manifest
    /// timer stops, buffered blocks are dropped, deferred callers get the
    /// failure, and idle writers go straight back to the pool.
    fn fail(&mut self, reason: String) {
        warn!("upload {} failed: {}", self.uuid, reason);
        self.state = State::Failed;
        self.failure = Some(reason);
        self.ticker_cancel.cancel();
        self.pending.clear();
        if let Some(reply) = self.deferred_write.take() {
            let _ = reply.send(self.failure_error());
        }
        if let Some(reply) = self.deferred_finalize.take() {
            let _ = reply.send(self.failure_error());
        }
        while let Some((_, writer)) = self.free_writers.pop_first() {
            self.pool.release(writer);
        }
    }

    fn failure_error<T>(&self) -> Result<T> {
        UploadFailedSnafu {
            reason: self
                .failure
                .clone()
                .unwrap_or_else(|| "unknown writer failure".to_string()),
        }
        .fail()
    }

    fn cancel_deferred(&mut self) {
        if let Some(reply) = self.deferred_write.take() {
            let _ = reply.send(UploadCancelledSnafu.fail());
        }
        if let Some(reply) = self.deferred_finalize.take() {
            let _ = reply.send(UploadCancelledSnafu.fail());
        }
    }

    /// Gives every writer back without waiting on outstanding I/O; those
    /// writes may still land on disk and are not rolled back.
    fn teardown(&mut self) {
        self.ticker_cancel.cancel();
        self.pending.clear();
        while let Some((_, writer)) = self.free_writers.pop_first() {
            self.pool.release(writer);
        }
        while let Some((_, writer)) = self.busy_writers.pop_first() {
            self.pool.release(writer);
        }
        self.tasks.close();
    }
}

fn spawn_ticker(
    tasks: &TaskTracker,
    event_tx: mpsc::Sender<Event>,
    period: std::time::Duration,
    cancel: CancellationToken,
) {
    tasks.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the zeroth tick fires immediately; the manifest is empty then
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    if event_tx.send(Event::ManifestTick).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
}
