//! Live probe connections: authentication, the process-wide session
//! registry, and the hot-reloaded credentials file.
//!
//! A probe connects to the streaming endpoint, proves it knows the shared
//! secret for its id, and then sits as a long-lived worker the dispatcher
//! can address. The registry holds at most one session per probe id; a
//! reconnect displaces the previous session (last writer wins).

use crate::dispatch::Dispatcher;
use crate::status::TaskResult;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub const CLOSE_UNAUTHORIZED: u16 = 4001;
pub const CLOSE_MISSING_PARAMS: u16 = 4002;
pub const CLOSE_REPLACED: u16 = 4000;

const CREDENTIALS_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Credentials

/// Probe-id → shared-secret map, swapped wholesale on every reload so auth
/// checks never observe a partial update.
#[derive(Clone, Default)]
pub struct CredentialStore {
    map: Arc<RwLock<Arc<HashMap<String, String>>>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, map: HashMap<String, String>) {
        *self.map.write().expect("credential store lock poisoned") = Arc::new(map);
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, String>> {
        self.map.read().expect("credential store lock poisoned").clone()
    }
}

pub fn parse_credentials(text: &str) -> Result<HashMap<String, String>, serde_json::Error> {
    serde_json::from_str(text)
}

/// Load the credentials file into the store, at startup and whenever its
/// modification time changes (polled once a second). An unreadable or
/// invalid file swaps in an empty map, denying all probe auth until a valid
/// file appears.
pub async fn watch_credentials(store: CredentialStore, path: PathBuf) {
    let mut last_modified: Option<SystemTime> = None;
    let mut loaded_once = false;
    let mut ticker = tokio::time::interval(CREDENTIALS_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let modified = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata.modified().ok(),
            Err(_) => None,
        };
        if loaded_once && modified == last_modified {
            continue;
        }
        last_modified = modified;
        loaded_once = true;
        reload_credentials(&store, &path).await;
    }
}

async fn reload_credentials(store: &CredentialStore, path: &Path) {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(error) => {
            warn!(
                "credentials file {} unreadable ({error}); denying all probe auth",
                path.display()
            );
            store.replace(HashMap::new());
            return;
        }
    };
    match parse_credentials(&text) {
        Ok(map) => {
            info!("loaded {} probe credential(s) from {}", map.len(), path.display());
            store.replace(map);
        }
        Err(error) => {
            warn!(
                "credentials file {} invalid ({error}); denying all probe auth",
                path.display()
            );
            store.replace(HashMap::new());
        }
    }
}

// ---------------------------------------------------------------------------
// Authentication

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    MissingParams,
    Unauthorized,
}

impl AuthError {
    pub fn close_code(self) -> u16 {
        match self {
            AuthError::MissingParams => CLOSE_MISSING_PARAMS,
            AuthError::Unauthorized => CLOSE_UNAUTHORIZED,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            AuthError::MissingParams => "Missing id or region",
            AuthError::Unauthorized => "Unauthorized",
        }
    }
}

/// Check a connecting probe's query parameters and bearer token against the
/// current credential snapshot.
pub fn authenticate(
    store: &CredentialStore,
    id: Option<&str>,
    region: Option<&str>,
    authorization: Option<&str>,
) -> Result<(String, String), AuthError> {
    let id = id.filter(|s| !s.is_empty()).ok_or(AuthError::MissingParams)?;
    let region = region
        .filter(|s| !s.is_empty())
        .ok_or(AuthError::MissingParams)?;
    let token = authorization
        .and_then(|header| header.strip_prefix("Bearer "))
        .ok_or(AuthError::Unauthorized)?;
    let credentials = store.snapshot();
    match credentials.get(id) {
        Some(secret) if secret == token => Ok((id.to_owned(), region.to_owned())),
        _ => Err(AuthError::Unauthorized),
    }
}

// ---------------------------------------------------------------------------
// Registry

struct ProbeSession {
    region: String,
    epoch: u64,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: Option<oneshot::Sender<()>>,
    last_seen: Instant,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, ProbeSession>,
    next_epoch: u64,
}

/// Registry of live probe sessions, keyed by probe id.
#[derive(Clone, Default)]
pub struct ProbeRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().expect("probe registry lock poisoned")
    }

    /// Insert a session, displacing (and signalling shutdown to) any
    /// previous session with the same id. Returns the connection epoch the
    /// session must present to [`unregister`](Self::unregister).
    pub fn register(
        &self,
        id: &str,
        region: &str,
        outbound: mpsc::UnboundedSender<String>,
        shutdown: oneshot::Sender<()>,
    ) -> u64 {
        let mut inner = self.locked();
        inner.next_epoch += 1;
        let epoch = inner.next_epoch;
        let session = ProbeSession {
            region: region.to_owned(),
            epoch,
            outbound,
            shutdown: Some(shutdown),
            last_seen: Instant::now(),
        };
        if let Some(mut displaced) = inner.sessions.insert(id.to_owned(), session) {
            warn!("probe {id} reconnected, displacing its previous session");
            if let Some(signal) = displaced.shutdown.take() {
                signal.send(()).ok();
            }
        }
        epoch
    }

    /// Remove a session if it still belongs to `epoch`. A displaced
    /// session's teardown therefore never evicts its replacement, making
    /// repeated unregistration idempotent.
    pub fn unregister(&self, id: &str, epoch: u64) -> bool {
        let mut inner = self.locked();
        if inner.sessions.get(id).is_some_and(|s| s.epoch == epoch) {
            inner.sessions.remove(id);
            true
        } else {
            false
        }
    }

    pub fn outbound(&self, id: &str) -> Option<mpsc::UnboundedSender<String>> {
        self.locked().sessions.get(id).map(|s| s.outbound.clone())
    }

    pub fn region_of(&self, id: &str) -> Option<String> {
        self.locked().sessions.get(id).map(|s| s.region.clone())
    }

    /// When the probe last sent us a frame.
    pub fn last_seen(&self, id: &str) -> Option<Instant> {
        self.locked().sessions.get(id).map(|s| s.last_seen)
    }

    pub fn touch(&self, id: &str) {
        if let Some(session) = self.locked().sessions.get_mut(id) {
            session.last_seen = Instant::now();
        }
    }

    /// Snapshot of connected probe ids, taken under the lock so fan-out can
    /// iterate without holding it across sends.
    pub fn probe_ids(&self) -> Vec<String> {
        self.locked().sessions.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.locked().sessions.len()
    }
}

// ---------------------------------------------------------------------------
// Per-connection driving

/// Drive one probe WebSocket for its whole life: authenticate, register,
/// pump outbound task frames, route inbound result frames to the
/// dispatcher, and unregister on the way out.
pub async fn run_session(
    registry: ProbeRegistry,
    dispatcher: Dispatcher,
    credentials: CredentialStore,
    id: Option<String>,
    region: Option<String>,
    authorization: Option<String>,
    mut socket: WebSocket,
) {
    let (id, region) = match authenticate(
        &credentials,
        id.as_deref(),
        region.as_deref(),
        authorization.as_deref(),
    ) {
        Ok(pair) => pair,
        Err(error) => {
            debug!("refusing probe connection: {}", error.reason());
            socket
                .send(Message::Close(Some(CloseFrame {
                    code: error.close_code(),
                    reason: error.reason().into(),
                })))
                .await
                .ok();
            return;
        }
    };

    info!("probe {id} connected (region {region})");
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let epoch = registry.register(&id, &region, outbound_tx, shutdown_tx);

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    registry.touch(&id);
                    handle_frame(&dispatcher, &id, &text);
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("probe {id} closed its stream");
                    break;
                }
                Some(Ok(_)) => {} // ping/pong/binary frames carry nothing for us
                Some(Err(error)) => {
                    warn!("probe {id} stream error: {error}");
                    break;
                }
            },
            outgoing = outbound_rx.recv() => match outgoing {
                Some(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        warn!("probe {id} write failed");
                        break;
                    }
                }
                None => break,
            },
            _ = &mut shutdown_rx => {
                debug!("probe {id} displaced by a newer connection");
                sink.send(Message::Close(Some(CloseFrame {
                    code: CLOSE_REPLACED,
                    reason: "Replaced".into(),
                })))
                .await
                .ok();
                break;
            }
        }
    }

    if registry.unregister(&id, epoch) {
        info!("probe {id} disconnected");
    }
}

fn handle_frame(dispatcher: &Dispatcher, probe_id: &str, text: &str) {
    match serde_json::from_str::<TaskResult>(text) {
        Ok(result) if !result.id.is_empty() => dispatcher.complete(result),
        Ok(_) => warn!("probe {probe_id} sent a task result without an id"),
        Err(error) => warn!("probe {probe_id} sent an undecodable frame: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(entries: &[(&str, &str)]) -> CredentialStore {
        let store = CredentialStore::new();
        store.replace(
            entries
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        );
        store
    }

    #[test]
    fn auth_decision_table() {
        let store = store_with(&[("alpha", "s3cret")]);

        let ok = authenticate(&store, Some("alpha"), Some("us-west"), Some("Bearer s3cret"));
        assert_eq!(ok, Ok(("alpha".to_owned(), "us-west".to_owned())));

        for (id, region, auth, expected) in [
            (None, Some("us"), Some("Bearer s3cret"), AuthError::MissingParams),
            (Some("alpha"), None, Some("Bearer s3cret"), AuthError::MissingParams),
            (Some(""), Some("us"), Some("Bearer s3cret"), AuthError::MissingParams),
            (Some("alpha"), Some("us"), None, AuthError::Unauthorized),
            (Some("alpha"), Some("us"), Some("s3cret"), AuthError::Unauthorized),
            (Some("alpha"), Some("us"), Some("Bearer wrong"), AuthError::Unauthorized),
            (Some("beta"), Some("us"), Some("Bearer s3cret"), AuthError::Unauthorized),
        ] {
            assert_eq!(authenticate(&store, id, region, auth), Err(expected));
        }
    }

    #[test]
    fn close_codes_match_the_stream_contract() {
        assert_eq!(AuthError::MissingParams.close_code(), 4002);
        assert_eq!(AuthError::Unauthorized.close_code(), 4001);
    }

    #[test]
    fn credentials_parse_and_swap_atomically() {
        let store = CredentialStore::new();
        assert!(store.snapshot().is_empty());

        let first = parse_credentials(r#"{"alpha": "a", "beta": "b"}"#).unwrap();
        store.replace(first);
        let before = store.snapshot();
        assert_eq!(before.len(), 2);

        store.replace(parse_credentials(r#"{"gamma": "c"}"#).unwrap());
        // the old snapshot is unchanged, the new one is complete
        assert_eq!(before.len(), 2);
        let after = store.snapshot();
        assert_eq!(after.get("gamma").map(String::as_str), Some("c"));
        assert!(!after.contains_key("alpha"));

        assert!(parse_credentials("not json").is_err());
        assert!(parse_credentials(r#"{"x": 3}"#).is_err());
    }

    #[tokio::test]
    async fn registry_keeps_one_session_per_id() {
        let registry = ProbeRegistry::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (shutdown1, mut displaced1) = oneshot::channel();
        let epoch1 = registry.register("alpha", "us-west", tx1, shutdown1);
        assert_eq!(registry.count(), 1);

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let (shutdown2, _displaced2) = oneshot::channel();
        let epoch2 = registry.register("alpha", "eu-central", tx2, shutdown2);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.region_of("alpha").as_deref(), Some("eu-central"));
        // the displaced session was told to go away
        displaced1.try_recv().unwrap();

        // stale epoch cannot evict the replacement
        assert!(!registry.unregister("alpha", epoch1));
        assert_eq!(registry.count(), 1);
        assert!(registry.unregister("alpha", epoch2));
        assert_eq!(registry.count(), 0);
        // idempotent once gone
        assert!(!registry.unregister("alpha", epoch2));
    }

    #[tokio::test]
    async fn outbound_reaches_the_registered_channel() {
        let registry = ProbeRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (shutdown, _displaced) = oneshot::channel();
        registry.register("alpha", "us", tx, shutdown);

        registry
            .outbound("alpha")
            .unwrap()
            .send("hello".to_owned())
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");
        assert!(registry.outbound("missing").is_none());
    }
}
