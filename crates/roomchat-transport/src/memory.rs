//! Scripted in-memory transport.
//!
//! [`MemoryTransport`] is handed to the session; the paired [`MemoryServer`]
//! stays with the test and plays the far end: it decides whether opens
//! succeed, records every frame the client sends and injects inbound frames
//! or disconnects into the live connection.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use roomchat_core::{Connection, Transport, TransportError, TransportEvent, TransportEvents};
use serde_json::Value;
use tokio::sync::mpsc;

/// Result of one scripted open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenOutcome {
    Accept,
    Refuse,
}

struct LiveConnection {
    open: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct Shared {
    script: VecDeque<OpenOutcome>,
    refuse_all: bool,
    fail_sends: bool,
    urls: Vec<String>,
    sent: Vec<(usize, String)>,
    current: Option<LiveConnection>,
    opened: usize,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client half, implementing [`Transport`].
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

/// Far-end half, used to drive and inspect the transport.
#[derive(Clone)]
pub struct MemoryServer {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryTransport {
    /// Create a connected transport/server pair.
    #[must_use]
    pub fn new() -> (Self, MemoryServer) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MemoryServer { shared },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Connection = MemoryConnection;

    async fn open(&self, url: &str) -> Result<(MemoryConnection, TransportEvents), TransportError> {
        let mut shared = lock(&self.shared);
        shared.urls.push(url.to_string());

        let outcome = shared.script.pop_front().unwrap_or(if shared.refuse_all {
            OpenOutcome::Refuse
        } else {
            OpenOutcome::Accept
        });
        if outcome == OpenOutcome::Refuse {
            tracing::debug!(url, "Memory transport refusing open");
            return Err(TransportError::Connect("refused by memory server".to_string()));
        }

        let index = shared.opened;
        shared.opened += 1;
        let open = Arc::new(AtomicBool::new(true));
        let (events, rx) = mpsc::unbounded_channel();
        if let Some(previous) = shared.current.replace(LiveConnection {
            open: Arc::clone(&open),
            events,
        }) {
            previous.open.store(false, Ordering::SeqCst);
        }

        let conn = MemoryConnection {
            index,
            open,
            shared: Arc::clone(&self.shared),
        };
        Ok((conn, rx))
    }
}

/// Connection handed out by [`MemoryTransport`].
pub struct MemoryConnection {
    index: usize,
    open: Arc<AtomicBool>,
    shared: Arc<Mutex<Shared>>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("index", &self.index)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Connection for MemoryConnection {
    fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut shared = lock(&self.shared);
        if shared.fail_sends {
            return Err(TransportError::Send("send failure injected".to_string()));
        }
        shared.sent.push((self.index, frame));
        Ok(())
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl MemoryServer {
    /// Refuse the next `n` opens.
    pub fn refuse_next(&self, n: usize) {
        lock(&self.shared)
            .script
            .extend(std::iter::repeat_n(OpenOutcome::Refuse, n));
    }

    /// Refuse every unscripted open.
    pub fn refuse_all(&self, refuse: bool) {
        lock(&self.shared).refuse_all = refuse;
    }

    /// Make every send fail until reset.
    pub fn fail_sends(&self, fail: bool) {
        lock(&self.shared).fail_sends = fail;
    }

    /// Number of open attempts, successful or not.
    #[must_use]
    pub fn open_attempts(&self) -> usize {
        lock(&self.shared).urls.len()
    }

    /// URLs passed to each open attempt.
    #[must_use]
    pub fn urls(&self) -> Vec<String> {
        lock(&self.shared).urls.clone()
    }

    /// Whether the most recent connection is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        lock(&self.shared)
            .current
            .as_ref()
            .is_some_and(|c| c.open.load(Ordering::SeqCst))
    }

    /// Every frame sent so far, across all connections.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        lock(&self.shared)
            .sent
            .iter()
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    /// Every frame sent so far, parsed as JSON.
    #[must_use]
    pub fn sent_json(&self) -> Vec<Value> {
        self.sent()
            .iter()
            .filter_map(|frame| serde_json::from_str(frame).ok())
            .collect()
    }

    /// Frames sent on the `n`th successful connection (0-based).
    #[must_use]
    pub fn sent_on(&self, connection: usize) -> Vec<String> {
        lock(&self.shared)
            .sent
            .iter()
            .filter(|(index, _)| *index == connection)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    /// Forget recorded frames.
    pub fn clear_sent(&self) {
        lock(&self.shared).sent.clear();
    }

    /// Deliver a frame on the live connection. Returns false if none.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        self.emit(TransportEvent::Message(frame.into()))
    }

    /// Deliver a JSON value on the live connection.
    pub fn push_json(&self, value: &Value) -> bool {
        self.push(value.to_string())
    }

    /// Report an error on the live connection without closing it.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.emit(TransportEvent::Error(reason.into()))
    }

    /// Close the live connection from the far end.
    pub fn disconnect(&self, code: Option<u16>) -> bool {
        let mut shared = lock(&self.shared);
        let Some(live) = shared.current.take() else {
            return false;
        };
        live.open.store(false, Ordering::SeqCst);
        live.events.send(TransportEvent::Closed { code }).is_ok()
    }

    /// Drop the live connection without telling the client, as a half-open
    /// socket would. Only `is_open` and `send` notice.
    pub fn sever(&self) -> bool {
        lock(&self.shared).current.take().is_some_and(|live| {
            live.open.store(false, Ordering::SeqCst);
            true
        })
    }

    fn emit(&self, event: TransportEvent) -> bool {
        lock(&self.shared)
            .current
            .as_ref()
            .is_some_and(|live| live.events.send(event).is_ok())
    }
}
