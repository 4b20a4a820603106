//! The generation worker: one background thread per [`ModelRunner`].
//!
//! The handle and the worker communicate only through channels and a
//! shared generating flag. Requests are served strictly FIFO, one at a
//! time; cancel/clear/config signals travel through dedicated
//! single-slot channels and are handled between generations, except that
//! cancellation is also observed by the token callback mid-generation.
//!
//! Thread design:
//! - control thread: owns the handle, enqueues requests and signals
//! - worker thread: lazily builds binding + personality, serves the loop

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::antiprompt::{check_antiprompt, truncate_at_hit};
use crate::binding::{BindingRegistry, LlmBinding, MessageKind};
use crate::config::AppConfig;
use crate::error::WorkerNotStartedError;
use crate::personality::processor::ProcessorRegistry;
use crate::personality::Personality;
use crate::worker::messages::{
    CancelSignal, ClearSignal, GenerationChunk, GenerationRequest, WorkerRequest,
};

/// Control handle for the generation worker.
///
/// `start` spawns the worker thread; after `stop` a fresh `start` spawns
/// a new one. The output chunk channel survives restarts.
pub struct ModelRunner {
    config: AppConfig,
    registry: Arc<BindingRegistry>,
    processors: Arc<ProcessorRegistry>,
    is_generating: Arc<AtomicBool>,
    binding_rebuilds: Arc<AtomicUsize>,
    personality_rebuilds: Arc<AtomicUsize>,
    chunk_tx: Sender<GenerationChunk>,
    chunk_rx: Receiver<GenerationChunk>,
    next_seq: AtomicU64,
    inner: Option<RunnerInner>,
}

/// Channels owned only while the worker is running.
struct RunnerInner {
    request_tx: Sender<WorkerRequest>,
    cancel_tx: Sender<CancelSignal>,
    clear_tx: Sender<ClearSignal>,
    config_tx: Sender<AppConfig>,
    started_rx: Receiver<u64>,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for ModelRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRunner")
            .field("binding", &self.config.binding)
            .field("started", &self.inner.is_some())
            .field("is_generating", &self.is_generating())
            .finish()
    }
}

impl ModelRunner {
    pub fn new(
        config: AppConfig,
        registry: Arc<BindingRegistry>,
        processors: Arc<ProcessorRegistry>,
    ) -> Self {
        let (chunk_tx, chunk_rx) = unbounded();
        Self {
            config,
            registry,
            processors,
            is_generating: Arc::new(AtomicBool::new(false)),
            binding_rebuilds: Arc::new(AtomicUsize::new(0)),
            personality_rebuilds: Arc::new(AtomicUsize::new(0)),
            chunk_tx,
            chunk_rx,
            next_seq: AtomicU64::new(0),
            inner: None,
        }
    }

    /// Spawn the worker thread. No-op when already started.
    pub fn start(&mut self) {
        if self.inner.is_some() {
            return;
        }

        let (request_tx, request_rx) = unbounded();
        let (cancel_tx, cancel_rx) = bounded(1);
        let (clear_tx, clear_rx) = bounded(1);
        let (config_tx, config_rx) = bounded(1);
        let (started_tx, started_rx) = unbounded();

        let config = self.config.clone();
        let registry = Arc::clone(&self.registry);
        let processors = Arc::clone(&self.processors);
        let chunk_tx = self.chunk_tx.clone();
        let is_generating = Arc::clone(&self.is_generating);
        let binding_rebuilds = Arc::clone(&self.binding_rebuilds);
        let personality_rebuilds = Arc::clone(&self.personality_rebuilds);

        let spawned = thread::Builder::new()
            .name("model-worker".to_string())
            .spawn(move || {
                // The binding is not Send, so the worker is assembled on
                // its own thread and never leaves it.
                let worker = Worker {
                    config,
                    registry,
                    processors,
                    binding: None,
                    personality: Personality::default(),
                    pending: VecDeque::new(),
                    request_rx,
                    chunk_tx,
                    cancel_rx,
                    clear_rx,
                    config_rx,
                    started_tx,
                    is_generating,
                    binding_rebuilds,
                    personality_rebuilds,
                };
                worker.run();
            });

        match spawned {
            Ok(handle) => {
                self.inner = Some(RunnerInner {
                    request_tx,
                    cancel_tx,
                    clear_tx,
                    config_tx,
                    started_rx,
                    handle,
                });
            }
            Err(e) => log::error!("couldn't spawn worker thread: {e}"),
        }
    }

    /// Send the stop sentinel and wait for the worker thread to exit.
    ///
    /// Blocks until any in-flight generation has finished. No-op when the
    /// worker was never started.
    pub fn stop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let _ = inner.request_tx.send(WorkerRequest::Stop);
            if inner.handle.join().is_err() {
                log::error!("worker thread panicked during shutdown");
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.is_some()
    }

    /// Enqueue a prompt for generation.
    ///
    /// When the worker has not been started the request is dropped and
    /// the typed error returned; callers may ignore it.
    pub fn generate(
        &self,
        prompt: impl Into<String>,
        id: u64,
    ) -> Result<(), WorkerNotStartedError> {
        let Some(inner) = self.inner.as_ref() else {
            return Err(WorkerNotStartedError);
        };
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        inner
            .request_tx
            .send(WorkerRequest::Generate(GenerationRequest::new(
                prompt.into(),
                id,
                seq,
            )))
            .map_err(|_| WorkerNotStartedError)
    }

    /// Request cancellation of the in-flight generation.
    ///
    /// At most one cancel request is outstanding at a time; a second one
    /// before the first is drained is dropped silently (redundant).
    pub fn cancel_generation(&self) {
        if let Some(inner) = self.inner.as_ref() {
            let _ = inner.cancel_tx.try_send(CancelSignal);
        }
    }

    /// Discard requests enqueued before this call that have not started.
    ///
    /// Never affects an already-started generation, and never discards
    /// requests enqueued after this call returns. Same single-slot
    /// semantics as `cancel_generation`.
    pub fn clear_queue(&self) {
        if let Some(inner) = self.inner.as_ref() {
            let up_to_seq = self.next_seq.load(Ordering::SeqCst);
            let _ = inner.clear_tx.try_send(ClearSignal { up_to_seq });
        }
    }

    /// Replace the worker's configuration wholesale.
    ///
    /// The worker rebuilds the binding only when binding or model
    /// identity changed, and the personality only when its
    /// name/category/language changed. The reload slot holds one
    /// configuration; a second call blocks until the worker drains it.
    pub fn set_config(&self, config: AppConfig) {
        if let Some(inner) = self.inner.as_ref() {
            let _ = inner.config_tx.send(config);
        }
    }

    /// Block until the worker begins a requested generation, returning
    /// the started request's id.
    pub fn wait_until_started(&self, timeout: Duration) -> Option<u64> {
        self.inner
            .as_ref()
            .and_then(|inner| inner.started_rx.recv_timeout(timeout).ok())
    }

    /// True exactly while a generation is in flight.
    pub fn is_generating(&self) -> bool {
        self.is_generating.load(Ordering::SeqCst)
    }

    /// Receiver for streamed output chunks. Cloneable; survives restarts.
    pub fn chunk_receiver(&self) -> Receiver<GenerationChunk> {
        self.chunk_rx.clone()
    }

    /// Number of successful binding constructions so far.
    pub fn binding_rebuilds(&self) -> usize {
        self.binding_rebuilds.load(Ordering::SeqCst)
    }

    /// Number of personality constructions so far.
    pub fn personality_rebuilds(&self) -> usize {
        self.personality_rebuilds.load(Ordering::SeqCst)
    }
}

impl Drop for ModelRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the worker thread.
struct Worker {
    config: AppConfig,
    registry: Arc<BindingRegistry>,
    processors: Arc<ProcessorRegistry>,
    binding: Option<Box<dyn LlmBinding>>,
    personality: Personality,
    /// Requests pulled off the channel but not yet served (clear-queue
    /// bookkeeping needs random access).
    pending: VecDeque<WorkerRequest>,
    request_rx: Receiver<WorkerRequest>,
    chunk_tx: Sender<GenerationChunk>,
    cancel_rx: Receiver<CancelSignal>,
    clear_rx: Receiver<ClearSignal>,
    config_rx: Receiver<AppConfig>,
    started_tx: Sender<u64>,
    is_generating: Arc<AtomicBool>,
    binding_rebuilds: Arc<AtomicUsize>,
    personality_rebuilds: Arc<AtomicUsize>,
}

impl Worker {
    fn run(mut self) {
        log::info!("[WORKER] model worker thread started");
        self.rebuild_binding();
        self.rebuild_personality();

        loop {
            self.drain_config();
            self.drain_cancel();
            self.drain_clear();

            let request = match self.next_request() {
                Some(WorkerRequest::Generate(request)) => request,
                // Stop sentinel, or every sender dropped.
                Some(WorkerRequest::Stop) | None => break,
            };

            self.drain_config();

            // Signals that arrived while we were blocked waiting for
            // work: a pending cancel drops this request; a pending clear
            // drops it only when it predates the clear mark.
            let cancel_pending = self.drain_cancel();
            let clear_mark = self.drain_clear();
            if cancel_pending || clear_mark.is_some_and(|mark| request.seq <= mark) {
                log::debug!(
                    "[WORKER] dropping request {} (cancel/clear pending at dequeue)",
                    request.id
                );
                continue;
            }

            self.serve(request);
        }

        log::info!("[WORKER] worker exiting");
    }

    /// Next request: the local buffer first, then a blocking dequeue.
    fn next_request(&mut self) -> Option<WorkerRequest> {
        if let Some(request) = self.pending.pop_front() {
            return Some(request);
        }
        self.request_rx.recv().ok()
    }

    /// Drain pending cancel signals; deassert the generating flag when
    /// one was present. Returns whether any signal was seen.
    fn drain_cancel(&mut self) -> bool {
        let mut seen = false;
        while self.cancel_rx.try_recv().is_ok() {
            seen = true;
        }
        if seen {
            self.is_generating.store(false, Ordering::SeqCst);
        }
        seen
    }

    /// Drain pending clear signals and discard covered queued requests.
    /// Returns the highest clear mark seen.
    fn drain_clear(&mut self) -> Option<u64> {
        let mut mark: Option<u64> = None;
        while let Ok(signal) = self.clear_rx.try_recv() {
            mark = Some(mark.map_or(signal.up_to_seq, |m| m.max(signal.up_to_seq)));
        }
        if let Some(mark) = mark {
            self.discard_pending(mark);
        }
        mark
    }

    /// Move everything queued into the local buffer and drop requests
    /// submitted at or before the clear mark. The stop sentinel survives.
    fn discard_pending(&mut self, mark: u64) {
        while let Ok(request) = self.request_rx.try_recv() {
            self.pending.push_back(request);
        }
        let before = self.pending.len();
        self.pending.retain(|request| match request {
            WorkerRequest::Stop => true,
            WorkerRequest::Generate(r) => r.seq > mark,
        });
        log::info!(
            "[WORKER] cleared {} pending request(s)",
            before - self.pending.len()
        );
    }

    fn drain_config(&mut self) {
        while let Ok(config) = self.config_rx.try_recv() {
            self.apply_config(config);
        }
    }

    /// Swap in a new configuration, rebuilding only the affected parts.
    fn apply_config(&mut self, config: AppConfig) {
        let old = std::mem::replace(&mut self.config, config);
        if old.binding != self.config.binding || old.model != self.config.model {
            self.rebuild_binding();
        }
        if old.personality != self.config.personality
            || old.personality_category != self.config.personality_category
            || old.personality_language != self.config.personality_language
        {
            self.rebuild_personality();
        }
    }

    /// (Re)construct the binding. On failure the previous binding, if
    /// any, stays in place; there is no retry.
    fn rebuild_binding(&mut self) {
        match self.registry.build(&self.config.binding, &self.config) {
            Ok(binding) => {
                log::info!(
                    "[WORKER] binding `{}` ready (model: {})",
                    binding.name(),
                    self.config.model.as_deref().unwrap_or("default")
                );
                self.binding = Some(binding);
                self.binding_rebuilds.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) if self.binding.is_some() => {
                log::error!(
                    "[WORKER] couldn't rebuild binding `{}`: {e}; keeping the previous binding",
                    self.config.binding
                );
            }
            Err(e) => {
                log::error!("[WORKER] couldn't build binding `{}`: {e}", self.config.binding);
            }
        }
    }

    /// (Re)construct the personality; falls back to the default persona.
    fn rebuild_personality(&mut self) {
        self.personality = Personality::load_or_default(
            &self.config.personalities_path,
            &self.config.personality_language,
            &self.config.personality_category,
            &self.config.personality,
            &self.processors,
        );
        self.personality_rebuilds.fetch_add(1, Ordering::SeqCst);
        log::info!("[WORKER] personality `{}` ready", self.personality.name);
    }

    /// Serve one request: flag up, started ack, generate, flag down.
    fn serve(&mut self, request: GenerationRequest) {
        self.is_generating.store(true, Ordering::SeqCst);
        let _ = self.started_tx.send(request.id);
        self.run_generation(&request);
        self.is_generating.store(false, Ordering::SeqCst);
    }

    fn run_generation(&mut self, request: &GenerationRequest) {
        let Some(binding) = self.binding.as_mut() else {
            log::error!(
                "[WORKER] no usable model binding, dropping request {}",
                request.id
            );
            return;
        };

        let params = self.config.sampling(&self.personality);
        let n_predict = self.config.n_predict(&self.personality);

        let preprocessed = match self.personality.processor.as_mut() {
            Some(processor) => processor
                .process_model_input(&request.prompt)
                .unwrap_or_else(|| request.prompt.clone()),
            None => request.prompt.clone(),
        };
        let use_workflow = self
            .personality
            .processor
            .as_ref()
            .is_some_and(|p| p.has_workflow());

        if self.config.debug {
            log::debug!(
                "[WORKER] request {}: {} prompt chars, n_predict {}",
                request.id,
                preprocessed.len(),
                n_predict
            );
        }

        let anti_prompts = self.personality.anti_prompts.clone();
        let chunk_tx = self.chunk_tx.clone();
        let cancel_rx = self.cancel_rx.clone();
        let flag = Arc::clone(&self.is_generating);
        let id = request.id;

        let mut accumulated = String::new();
        let mut callback = |text: &str, kind: MessageKind| -> bool {
            // Cancellation takes effect no later than this invocation:
            // once observed, the current fragment is withheld too.
            if cancel_rx.try_recv().is_ok() {
                flag.store(false, Ordering::SeqCst);
            }
            if !flag.load(Ordering::SeqCst) {
                return false;
            }
            if kind != MessageKind::Chunk {
                return true;
            }
            accumulated.push_str(text);
            if let Some(hit) = check_antiprompt(&accumulated, &anti_prompts) {
                log::info!("[WORKER] anti-prompt {:?} detected, truncating output", hit.marker);
                truncate_at_hit(&mut accumulated, &hit);
                return false;
            }
            let _ = chunk_tx.send(GenerationChunk {
                text: text.to_string(),
                id,
            });
            flag.load(Ordering::SeqCst)
        };

        let result = if use_workflow {
            let mut generate_fn = |prompt: &str, budget: u32| {
                let budget = if budget == 0 { n_predict } else { budget };
                binding.generate(prompt, budget, &params, &mut callback)
            };
            match self.personality.processor.as_mut() {
                Some(processor) => {
                    processor.run_workflow(&request.prompt, &preprocessed, &mut generate_fn)
                }
                None => generate_fn(&preprocessed, 0),
            }
        } else {
            binding.generate(&preprocessed, n_predict, &params, &mut callback)
        };

        if let Err(failure) = &result {
            log::warn!(
                "[WORKER] generation {} failed: {failure} (keeping {} streamed chars)",
                request.id,
                accumulated.len()
            );
        }

        let mut final_text = accumulated;
        if let Some(processor) = self.personality.processor.as_mut() {
            if let Some(post) = processor.process_model_output(&final_text) {
                final_text = post;
            }
        }
        log::debug!(
            "[WORKER] request {} finished ({} chars)",
            request.id,
            final_text.len()
        );
    }
}
