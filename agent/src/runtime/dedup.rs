//! Bounded outcome cache for idempotent execute.
//!
//! Entries are keyed by [`RequestKey`]: the client, the model the credential
//! is bound to, the request id and a digest of the inputs. Requests that
//! share an id but differ in model or payload never share an outcome. Each
//! credential that touched an entry is also indexed against it so a retry
//! carrying an already consumed credential can be answered before
//! re-validation.
//!
//! An entry is `Pending` while its owner runs and `Done` once the owner
//! stores a cacheable outcome. Concurrent duplicates wait on the pending
//! entry instead of executing again.

use infermesh_common::wire::ExecuteResponse;
use infermesh_common::{ModelRef, NamedTensors, TensorData};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

type Outcome = Option<Arc<ExecuteResponse>>;

/// SHA-256 over the inputs' names, dtypes, shapes and values.
pub fn fingerprint(inputs: &NamedTensors) -> String {
    let mut hasher = Sha256::new();
    for (name, tensor) in inputs {
        hasher.update((name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update(tensor.element_type().as_str().as_bytes());
        hasher.update((tensor.shape.len() as u64).to_le_bytes());
        for dim in &tensor.shape {
            hasher.update(dim.to_le_bytes());
        }
        hasher.update((tensor.data.len() as u64).to_le_bytes());
        match &tensor.data {
            TensorData::F32(v) => v.iter().for_each(|x| hasher.update(x.to_le_bytes())),
            TensorData::F64(v) => v.iter().for_each(|x| hasher.update(x.to_le_bytes())),
            TensorData::I32(v) => v.iter().for_each(|x| hasher.update(x.to_le_bytes())),
            TensorData::I64(v) => v.iter().for_each(|x| hasher.update(x.to_le_bytes())),
            TensorData::U8(v) => hasher.update(v),
            TensorData::Bool(v) => v.iter().for_each(|x| hasher.update([*x as u8])),
        }
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// One logical request as seen by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub client: String,
    pub model: ModelRef,
    pub request_id: String,
    pub fingerprint: String,
}

/// `(credential, request_id, fingerprint)`
type TokenKey = (String, String, String);

fn token_key(token: &str, key: &RequestKey) -> TokenKey {
    (
        token.to_string(),
        key.request_id.clone(),
        key.fingerprint.clone(),
    )
}

enum Slot {
    Pending(watch::Receiver<Outcome>),
    Done {
        response: Arc<ExecuteResponse>,
        completed_at: Instant,
    },
}

struct Entry {
    slot: Slot,
    tokens: Vec<String>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<RequestKey, Entry>,
    by_token: HashMap<TokenKey, RequestKey>,
}

impl Inner {
    fn remove(&mut self, key: &RequestKey) {
        if let Some(entry) = self.entries.remove(key) {
            for token in entry.tokens {
                self.by_token.remove(&token_key(&token, key));
            }
        }
    }

    fn lookup(&self, key: &RequestKey) -> Option<Lookup> {
        self.entries.get(key).map(|entry| match &entry.slot {
            Slot::Pending(rx) => Lookup::Pending(rx.clone()),
            Slot::Done { response, .. } => Lookup::Done(response.clone()),
        })
    }
}

/// A prior attempt of the same request.
pub enum Lookup {
    Done(Arc<ExecuteResponse>),
    Pending(watch::Receiver<Outcome>),
}

impl Lookup {
    /// The prior attempt's response, waiting for it if still running.
    /// `None` if the owner gave up without an outcome.
    pub async fn resolve(self) -> Outcome {
        match self {
            Lookup::Done(response) => Some(response),
            Lookup::Pending(mut rx) => {
                let outcome = rx.wait_for(|outcome| outcome.is_some()).await.ok()?;
                outcome.clone()
            }
        }
    }
}

pub enum Claim {
    /// First attempt: the caller must run the request and complete the guard.
    Owner(DedupGuard),
    Existing(Lookup),
}

pub struct DedupCache {
    capacity: usize,
    ttl: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Prior attempt made with this exact credential and payload.
    pub fn lookup_token(&self, token: &str, request_id: &str, fingerprint: &str) -> Option<Lookup> {
        let inner = self.inner.lock().ok()?;
        let key = inner
            .by_token
            .get(&(
                token.to_string(),
                request_id.to_string(),
                fingerprint.to_string(),
            ))?
            .clone();
        let lookup = inner.lookup(&key)?;
        if let Lookup::Done(_) = &lookup {
            if self.expired(&inner, &key) {
                return None;
            }
        }
        Some(lookup)
    }

    fn expired(&self, inner: &Inner, key: &RequestKey) -> bool {
        matches!(
            inner.entries.get(key).map(|e| &e.slot),
            Some(Slot::Done { completed_at, .. }) if completed_at.elapsed() >= self.ttl
        )
    }

    /// Find a prior attempt of `key` or become its owner. Either way `token`
    /// is indexed against the entry.
    pub fn claim(&self, key: RequestKey, token: &str) -> Claim {
        let Ok(mut inner) = self.inner.lock() else {
            // Without the cache every attempt runs; the guard is detached.
            let (tx, _) = watch::channel(None);
            return Claim::Owner(DedupGuard {
                key,
                tx,
                inner: Arc::downgrade(&self.inner),
                detached: true,
                ttl: self.ttl,
                capacity: self.capacity,
            });
        };

        if self.expired(&inner, &key) {
            inner.remove(&key);
        }

        let alias = token_key(token, &key);
        if let Some(lookup) = inner.lookup(&key) {
            if let Some(entry) = inner.entries.get_mut(&key) {
                if !entry.tokens.iter().any(|t| t == token) {
                    entry.tokens.push(token.to_string());
                }
            }
            inner.by_token.insert(alias, key);
            return Claim::Existing(lookup);
        }

        let (tx, rx) = watch::channel(None);
        inner.entries.insert(
            key.clone(),
            Entry {
                slot: Slot::Pending(rx),
                tokens: vec![token.to_string()],
            },
        );
        inner.by_token.insert(alias, key.clone());

        Claim::Owner(DedupGuard {
            key,
            tx,
            inner: Arc::downgrade(&self.inner),
            detached: false,
            ttl: self.ttl,
            capacity: self.capacity,
        })
    }

    /// Drop completed entries older than the TTL.
    pub fn purge_expired(&self) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        purge(&mut inner, self.ttl)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn purge(inner: &mut Inner, ttl: Duration) -> usize {
    let expired: Vec<RequestKey> = inner
        .entries
        .iter()
        .filter(|(_, e)| matches!(&e.slot, Slot::Done { completed_at, .. } if completed_at.elapsed() >= ttl))
        .map(|(k, _)| k.clone())
        .collect();
    for key in &expired {
        inner.remove(key);
    }
    expired.len()
}

/// Ownership of a pending entry. Completing it publishes the outcome to
/// waiters; dropping it uncompleted removes the entry so a retry runs afresh.
pub struct DedupGuard {
    key: RequestKey,
    tx: watch::Sender<Outcome>,
    inner: std::sync::Weak<Mutex<Inner>>,
    detached: bool,
    ttl: Duration,
    capacity: usize,
}

impl DedupGuard {
    /// Publish `response` to waiters. With `cache` set the outcome is kept
    /// for later retries; otherwise the entry is dropped.
    pub fn complete(mut self, response: Arc<ExecuteResponse>, cache: bool) {
        if !self.detached {
            if let Some(inner) = self.inner.upgrade() {
                if let Ok(mut inner) = inner.lock() {
                    if cache {
                        if let Some(entry) = inner.entries.get_mut(&self.key) {
                            entry.slot = Slot::Done {
                                response: response.clone(),
                                completed_at: Instant::now(),
                            };
                        }
                        enforce_capacity(&mut inner, self.capacity, self.ttl);
                    } else {
                        inner.remove(&self.key);
                    }
                }
            }
        }
        self.detached = true;
        self.tx.send_replace(Some(response));
    }
}

impl Drop for DedupGuard {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            if let Ok(mut inner) = inner.lock() {
                inner.remove(&self.key);
            }
        }
        debug!(request_id = %self.key.request_id, "Dedup entry abandoned");
    }
}

/// Evict expired entries, then the oldest completed ones, until within capacity.
fn enforce_capacity(inner: &mut Inner, capacity: usize, ttl: Duration) {
    if inner.entries.len() <= capacity {
        return;
    }
    purge(inner, ttl);

    while inner.entries.len() > capacity {
        let oldest = inner
            .entries
            .iter()
            .filter_map(|(k, e)| match &e.slot {
                Slot::Done { completed_at, .. } => Some((k.clone(), *completed_at)),
                Slot::Pending(_) => None,
            })
            .min_by_key(|(_, at)| *at)
            .map(|(k, _)| k);
        match oldest {
            Some(key) => inner.remove(&key),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infermesh_common::wire::Timing;
    use infermesh_common::Tensor;

    fn response(request_id: &str) -> Arc<ExecuteResponse> {
        Arc::new(ExecuteResponse::ok(
            request_id.to_string(),
            NamedTensors::new(),
            Timing::default(),
        ))
    }

    fn key(client: &str, request_id: &str) -> RequestKey {
        RequestKey {
            client: client.into(),
            model: ModelRef::new("linear", "v1"),
            request_id: request_id.into(),
            fingerprint: "f0".into(),
        }
    }

    fn owner(claim: Claim) -> DedupGuard {
        match claim {
            Claim::Owner(guard) => guard,
            Claim::Existing(_) => panic!("expected to own the request"),
        }
    }

    fn existing(claim: Claim) -> Lookup {
        match claim {
            Claim::Existing(lookup) => lookup,
            Claim::Owner(_) => panic!("expected an existing entry"),
        }
    }

    #[tokio::test]
    async fn test_completed_outcome_is_shared() {
        let cache = DedupCache::new(10, Duration::from_secs(60));
        let guard = owner(cache.claim(key("alice", "r1"), "tok-1"));
        guard.complete(response("r1"), true);

        // Same client with a fresh credential.
        let hit = existing(cache.claim(key("alice", "r1"), "tok-2")).resolve().await;
        assert_eq!(hit.unwrap().request_id, "r1");

        // Both credentials now resolve through the token index.
        assert!(cache.lookup_token("tok-1", "r1", "f0").is_some());
        assert!(cache.lookup_token("tok-2", "r1", "f0").is_some());
        assert!(cache.lookup_token("tok-1", "r1", "other-inputs").is_none());

        // Other clients do not share request ids.
        assert!(matches!(cache.claim(key("bob", "r1"), "tok-3"), Claim::Owner(_)));
    }

    #[tokio::test]
    async fn test_model_and_payload_scope_the_entry() {
        let cache = DedupCache::new(10, Duration::from_secs(60));
        owner(cache.claim(key("alice", "r1"), "tok-1")).complete(response("r1"), true);

        let mut other_model = key("alice", "r1");
        other_model.model = ModelRef::new("linear", "v2");
        assert!(matches!(cache.claim(other_model, "tok-2"), Claim::Owner(_)));

        let mut other_inputs = key("alice", "r1");
        other_inputs.fingerprint = "f1".into();
        assert!(matches!(cache.claim(other_inputs, "tok-3"), Claim::Owner(_)));
    }

    #[test]
    fn test_fingerprint_follows_payload() {
        let tensors = |values: Vec<f32>| {
            let mut inputs = NamedTensors::new();
            inputs.insert("input".into(), Tensor::f32(vec![1, 5], values).unwrap());
            inputs
        };
        let a = fingerprint(&tensors(vec![1.0, 2.0, 3.0, 4.0, 5.0]));
        assert_eq!(a, fingerprint(&tensors(vec![1.0, 2.0, 3.0, 4.0, 5.0])));
        assert_ne!(a, fingerprint(&tensors(vec![10.0; 5])));
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_waits_for_owner() {
        let cache = DedupCache::new(10, Duration::from_secs(60));
        let guard = owner(cache.claim(key("alice", "r1"), "tok-1"));
        let waiter = existing(cache.claim(key("alice", "r1"), "tok-1"));

        let handle = tokio::spawn(waiter.resolve());
        tokio::task::yield_now().await;
        guard.complete(response("r1"), true);

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.request_id, "r1");
    }

    #[tokio::test]
    async fn test_uncached_outcome_allows_rerun() {
        let cache = DedupCache::new(10, Duration::from_secs(60));
        let guard = owner(cache.claim(key("alice", "r1"), "tok-1"));
        let waiter = existing(cache.claim(key("alice", "r1"), "tok-1"));
        guard.complete(response("r1"), false);

        // The waiter still sees the outcome it was waiting on.
        assert!(waiter.resolve().await.is_some());
        assert!(cache.is_empty());
        assert!(matches!(cache.claim(key("alice", "r1"), "tok-1"), Claim::Owner(_)));
    }

    #[tokio::test]
    async fn test_abandoned_guard_releases_entry() {
        let cache = DedupCache::new(10, Duration::from_secs(60));
        let guard = owner(cache.claim(key("alice", "r1"), "tok-1"));
        let waiter = existing(cache.claim(key("alice", "r1"), "tok-1"));
        drop(guard);

        assert!(waiter.resolve().await.is_none());
        assert!(cache.lookup_token("tok-1", "r1", "f0").is_none());
        assert!(matches!(cache.claim(key("alice", "r1"), "tok-1"), Claim::Owner(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = DedupCache::new(10, Duration::from_secs(5));
        owner(cache.claim(key("alice", "r1"), "tok-1")).complete(response("r1"), true);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.lookup_token("tok-1", "r1", "f0").is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest_completed() {
        let cache = DedupCache::new(2, Duration::from_secs(60));
        for id in ["r1", "r2", "r3"] {
            owner(cache.claim(key("alice", id), "tok")).complete(response(id), true);
            tokio::time::advance(Duration::from_millis(5)).await;
        }

        assert_eq!(cache.len(), 2);
        assert!(matches!(cache.claim(key("alice", "r1"), "tok"), Claim::Owner(_)));
    }
}
