//! One live PTY session: the chunk pipeline that batches output into
//! size-capped `pty-data` messages, per-client ACK accounting that pauses and
//! resumes the PTY reader, prompt/idle interaction detection, and the probe
//! state for the silent resume-failure restart.
//!
//! All mutable state sits behind one mutex and is never held across an await;
//! client sends go through unbounded channels and the PTY reader lives on its
//! own thread, so handlers stay lock-then-leave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::notify::PushNotifier;
use crate::session::SessionRecord;

use super::client::{ClientHandle, ServerMessage};
use super::interaction::chunk_requests_interaction;
use super::process::PtyProcess;
use super::{
    ACK_PAUSE_THRESHOLD, ACK_RESUME_THRESHOLD, IDLE_THRESHOLD_MS, OUTPUT_BATCH_INTERVAL_MS,
    OUTPUT_MAX_BUFFER_SIZE, OUTPUT_MAX_CHUNK_SIZE, OUTPUT_THROTTLE_MS, PAUSE_TIMEOUT_MS,
    RESUME_FAILURE_MARKER, RETRY_DETECTION_LIMIT,
};

struct SessionState {
    clients: Vec<ClientHandle>,
    /// Unacked bytes per client id. Every attached client has an entry.
    pending_bytes: HashMap<u64, u64>,

    /// Output chunks not yet fully sent, plus how many from the head already
    /// went out. The index avoids head-slicing the backlog on every flush.
    chunks: Vec<Bytes>,
    buffer_size: usize,
    chunks_sent: usize,
    flush_timer: Option<JoinHandle<()>>,
    last_flush: Option<Instant>,

    last_output: Instant,
    idle_timer: Option<JoinHandle<()>>,
    interaction_notified: bool,

    /// Resume-failure probe: first ≤1 KiB of output after a resume attempt.
    retry_buffer: Vec<u8>,
    retry_complete: bool,
    restarting: bool,

    paused: bool,
    pause_timeout: Option<JoinHandle<()>>,

    /// Set once on exit/stop; all later events are ignored.
    stopped: bool,
}

/// A live PTY bound to a persisted session. Owned by the registry.
pub struct PtySession {
    pub(crate) record: SessionRecord,
    pub(crate) initial_prompt: Option<String>,
    /// True when started with `--resume`: arms the stale-conversation probe.
    resume_probe: bool,
    pub(crate) process: PtyProcess,
    notifier: Arc<dyn PushNotifier>,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("session_id", &self.record.session_id)
            .finish()
    }
}

impl PtySession {
    pub(crate) fn new(
        record: SessionRecord,
        initial_prompt: Option<String>,
        resume_probe: bool,
        process: PtyProcess,
        notifier: Arc<dyn PushNotifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            record,
            initial_prompt,
            resume_probe,
            process,
            notifier,
            state: Mutex::new(SessionState {
                clients: Vec::new(),
                pending_bytes: HashMap::new(),
                chunks: Vec::new(),
                buffer_size: 0,
                chunks_sent: 0,
                flush_timer: None,
                last_flush: None,
                last_output: Instant::now(),
                idle_timer: None,
                interaction_notified: false,
                retry_buffer: Vec::new(),
                retry_complete: false,
                restarting: false,
                paused: false,
                pause_timeout: None,
                stopped: false,
            }),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.record.session_id
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state poisoned")
    }

    /// Add a client to the fan-out set. False once the session is winding down.
    pub fn attach(&self, client: ClientHandle) -> bool {
        let mut st = self.lock();
        if st.stopped {
            return false;
        }
        st.pending_bytes.insert(client.id, 0);
        st.clients.push(client);
        true
    }

    /// Remove a client and re-check the pause: a stuck client leaving must
    /// unblock the others.
    pub fn detach(&self, client_id: u64) {
        let mut st = self.lock();
        st.clients.retain(|c| c.id != client_id);
        st.pending_bytes.remove(&client_id);
        self.maybe_resume(&mut st);
    }

    /// Apply a client ACK and resume the PTY if everyone has caught up.
    pub fn handle_ack(&self, client_id: u64, bytes: u64) {
        let mut st = self.lock();
        if let Some(p) = st.pending_bytes.get_mut(&client_id) {
            *p = p.saturating_sub(bytes);
        }
        self.maybe_resume(&mut st);
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn attached_clients(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn is_restarting(&self) -> bool {
        self.lock().restarting
    }

    /// Called before an explicit stop so the exit handler takes the normal
    /// path even if a restart probe fired concurrently.
    pub(crate) fn mark_stopping(&self) {
        self.lock().restarting = false;
    }

    /// One raw chunk from the PTY reader.
    pub(crate) fn handle_output(self: &Arc<Self>, data: Bytes) {
        let mut st = self.lock();
        if st.stopped || st.restarting {
            return;
        }

        // Resume-failure probe: scan the first 1 KiB for the stale marker.
        if self.resume_probe && !st.retry_complete {
            let room = RETRY_DETECTION_LIMIT.saturating_sub(st.retry_buffer.len());
            let take = data.len().min(room);
            st.retry_buffer.extend_from_slice(&data[..take]);
            if contains_marker(&st.retry_buffer) {
                st.restarting = true;
                st.retry_complete = true;
                st.retry_buffer = Vec::new();
                drop(st);
                info!(session_id = %self.record.session_id, "stale conversation on resume; restarting");
                if let Err(e) = self.process.kill() {
                    warn!(session_id = %self.record.session_id, error = %e, "kill for restart failed");
                }
                return;
            }
            if st.retry_buffer.len() >= RETRY_DETECTION_LIMIT {
                st.retry_complete = true;
                st.retry_buffer = Vec::new();
            }
        }

        // Interaction detection: a prompt-looking chunk notifies once; any
        // other output re-arms the edge trigger.
        st.last_output = Instant::now();
        if chunk_requests_interaction(&data) {
            self.notify_interaction(&mut st, "Input prompt detected");
        } else {
            st.interaction_notified = false;
        }
        if st.idle_timer.is_none() {
            self.arm_idle_timer(&mut st);
        }

        // Chunk pipeline.
        st.buffer_size += data.len();
        st.chunks.push(data);
        if st.buffer_size > OUTPUT_MAX_BUFFER_SIZE {
            let mut dropped = 0usize;
            while st.buffer_size > OUTPUT_MAX_BUFFER_SIZE && !st.chunks.is_empty() {
                let c = st.chunks.remove(0);
                st.buffer_size -= c.len();
                dropped += 1;
            }
            st.chunks_sent = st.chunks_sent.saturating_sub(dropped);
            warn!(
                session_id = %self.record.session_id,
                dropped,
                "output buffer overflow, dropping oldest chunks; flow control is misconfigured"
            );
        }
        if st.flush_timer.is_none() {
            self.schedule_flush(&mut st, Duration::from_millis(OUTPUT_BATCH_INTERVAL_MS));
        }
    }

    /// Send up to one size-capped `pty-data` message to every client.
    fn flush(self: &Arc<Self>) {
        let mut st = self.lock();
        st.flush_timer = None;
        if st.stopped {
            return;
        }
        let unsent = unsent_len(&st.chunks, st.chunks_sent);
        if unsent == 0 {
            return;
        }

        // Throttle: space flushes out unless a full message is already waiting.
        if let Some(last) = st.last_flush {
            let elapsed = last.elapsed();
            let min_gap = Duration::from_millis(OUTPUT_THROTTLE_MS);
            if elapsed < min_gap && unsent < OUTPUT_MAX_CHUNK_SIZE {
                let remaining = min_gap - elapsed;
                self.schedule_flush(&mut st, remaining);
                return;
            }
        }

        let (payload, taken) = collect_batch(&st.chunks, st.chunks_sent);
        st.chunks_sent += taken;
        if st.chunks_sent == st.chunks.len() {
            st.chunks.clear();
            st.chunks_sent = 0;
            st.buffer_size = 0;
        }
        st.last_flush = Some(Instant::now());

        self.send_data(&mut st, &payload);

        if unsent_len(&st.chunks, st.chunks_sent) > 0 {
            self.schedule_flush(&mut st, Duration::from_millis(OUTPUT_THROTTLE_MS));
        }
    }

    /// Deliver one payload to all clients, bump their unacked counts, and
    /// pause the PTY when someone falls too far behind.
    fn send_data(self: &Arc<Self>, st: &mut SessionState, payload: &[u8]) {
        let msg = ServerMessage::PtyData {
            session_id: self.record.session_id.clone(),
            data: String::from_utf8_lossy(payload).into_owned(),
        };
        let len = payload.len() as u64;
        let mut delivered: Vec<u64> = Vec::with_capacity(st.clients.len());
        for c in &st.clients {
            if c.send(msg.clone()) {
                delivered.push(c.id);
            }
            // A failed send means the socket is going away; the close handler
            // will detach it. Never remove here.
        }
        for id in delivered {
            *st.pending_bytes.entry(id).or_insert(0) += len;
        }

        if !st.paused {
            let worst = st.pending_bytes.values().copied().max().unwrap_or(0);
            if worst >= ACK_PAUSE_THRESHOLD {
                st.paused = true;
                self.process.pause();
                self.arm_pause_timeout(st);
            }
        }
    }

    fn maybe_resume(&self, st: &mut SessionState) {
        if !st.paused {
            return;
        }
        let worst = st.pending_bytes.values().copied().max().unwrap_or(0);
        if worst < ACK_RESUME_THRESHOLD {
            st.paused = false;
            if let Some(t) = st.pause_timeout.take() {
                t.abort();
            }
            self.process.resume();
        }
    }

    fn arm_pause_timeout(self: &Arc<Self>, st: &mut SessionState) {
        if let Some(t) = st.pause_timeout.take() {
            t.abort();
        }
        let session = Arc::clone(self);
        st.pause_timeout = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(PAUSE_TIMEOUT_MS)).await;
            let mut st = session.lock();
            st.pause_timeout = None;
            if st.paused {
                st.paused = false;
                session.process.resume();
                warn!(
                    session_id = %session.record.session_id,
                    "client never acked for {PAUSE_TIMEOUT_MS}ms; force-resuming PTY"
                );
            }
        }));
    }

    fn schedule_flush(self: &Arc<Self>, st: &mut SessionState, delay: Duration) {
        let session = Arc::clone(self);
        st.flush_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            session.flush();
        }));
    }

    fn arm_idle_timer(self: &Arc<Self>, st: &mut SessionState) {
        let session = Arc::clone(self);
        st.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(IDLE_THRESHOLD_MS)).await;
            let mut st = session.lock();
            st.idle_timer = None;
            if st.stopped {
                return;
            }
            if st.last_output.elapsed() >= Duration::from_millis(IDLE_THRESHOLD_MS) {
                session.notify_interaction(&mut st, "Waiting for input (idle)");
            }
        }));
    }

    /// Edge-triggered: one broadcast + one push per quiet period.
    fn notify_interaction(&self, st: &mut SessionState, reason: &str) {
        if st.interaction_notified {
            return;
        }
        st.interaction_notified = true;
        let msg = ServerMessage::InteractionNeeded {
            session_id: self.record.session_id.clone(),
            reason: reason.to_string(),
        };
        for c in &st.clients {
            let _ = c.send(msg.clone());
        }

        let notifier = Arc::clone(&self.notifier);
        let session_id = self.record.session_id.clone();
        let name = self.record.friendly_name.clone();
        let reason = reason.to_string();
        tokio::spawn(async move {
            let data = serde_json::json!({ "sessionId": session_id, "reason": reason });
            if let Err(e) = notifier.send("Agent waiting for input", &name, data).await {
                warn!(%session_id, error = %e, "push notification failed");
            }
        });
    }

    /// Non-restart exit: drain what is left, tell every client, tear down.
    pub(crate) fn finish_exit(self: &Arc<Self>, exit_code: u32) {
        let mut st = self.lock();
        if st.stopped {
            return;
        }
        st.stopped = true;

        while unsent_len(&st.chunks, st.chunks_sent) > 0 {
            let (payload, taken) = collect_batch(&st.chunks, st.chunks_sent);
            st.chunks_sent += taken;
            self.send_data(&mut st, &payload);
        }

        let msg = ServerMessage::PtyExit {
            session_id: self.record.session_id.clone(),
            exit_code: exit_code as i32,
        };
        for c in &st.clients {
            let _ = c.send(msg.clone());
        }
        Self::teardown(&mut st);
    }

    /// Restart exit: keep the clients for the replacement session, tear down
    /// everything else, emit nothing.
    pub(crate) fn take_clients_for_restart(&self) -> Vec<ClientHandle> {
        let mut st = self.lock();
        st.stopped = true;
        let clients = std::mem::take(&mut st.clients);
        Self::teardown(&mut st);
        clients
    }

    fn teardown(st: &mut SessionState) {
        for t in [
            st.flush_timer.take(),
            st.idle_timer.take(),
            st.pause_timeout.take(),
        ]
        .into_iter()
        .flatten()
        {
            t.abort();
        }
        st.chunks.clear();
        st.chunks_sent = 0;
        st.buffer_size = 0;
        st.clients.clear();
        st.pending_bytes.clear();
        st.paused = false;
        st.retry_buffer = Vec::new();
    }
}

fn contains_marker(buf: &[u8]) -> bool {
    buf.windows(RESUME_FAILURE_MARKER.len())
        .any(|w| w == RESUME_FAILURE_MARKER.as_bytes())
}

fn unsent_len(chunks: &[Bytes], sent: usize) -> usize {
    chunks[sent..].iter().map(|c| c.len()).sum()
}

/// Concatenate whole chunks from `from` up to the outbound message cap.
/// Always takes at least one chunk so an oversized chunk still drains.
fn collect_batch(chunks: &[Bytes], from: usize) -> (Bytes, usize) {
    let mut total = 0usize;
    let mut taken = 0usize;
    for c in &chunks[from..] {
        if taken > 0 && total + c.len() > OUTPUT_MAX_CHUNK_SIZE {
            break;
        }
        total += c.len();
        taken += 1;
        if total >= OUTPUT_MAX_CHUNK_SIZE {
            break;
        }
    }
    let mut buf = BytesMut::with_capacity(total);
    for c in &chunks[from..from + taken] {
        buf.extend_from_slice(c);
    }
    (buf.freeze(), taken)
}
