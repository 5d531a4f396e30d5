use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::envelope::{RpcKind, RpcMessage};
use crate::error::RpcError;

/// Receiving side of one pending call's reply slot.
pub type ReplySlot<R> = oneshot::Receiver<Result<R, RpcError>>;

/// Correlates outgoing unary calls with the replies that answer them.
///
/// Ids start at 1 and are never reused; 0 means "no RPC association". Each
/// outstanding call owns a oneshot slot that is resolved exactly once, by
/// [`route`](Self::route) or [`shutdown`](Self::shutdown), or discarded by
/// [`erase`](Self::erase). All operations take the same lock, so they are
/// atomic with respect to each other.
pub struct Secretary<R> {
    state: Mutex<State<R>>,
}

struct State<R> {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Result<R, RpcError>>>,
    shut_down: bool,
}

impl<R> Secretary<R> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1,
                pending: HashMap::new(),
                shut_down: false,
            }),
        }
    }

    /// Allocate the next id and a slot for its reply.
    ///
    /// Fails with [`RpcError::Shutdown`] once the secretary has shut down,
    /// since no reply could ever be routed.
    pub fn record(&self) -> Result<(u64, ReplySlot<R>), RpcError> {
        let mut state = self.lock();
        if state.shut_down {
            return Err(RpcError::Shutdown);
        }
        let id = state.next_id;
        state.next_id += 1;

        let (tx, rx) = oneshot::channel();
        state.pending.insert(id, tx);
        trace!(id, pending = state.pending.len(), "recorded call");
        Ok((id, rx))
    }

    /// Drop a pending slot without resolving it. Returns whether it existed.
    pub fn erase(&self, id: u64) -> bool {
        self.lock().pending.remove(&id).is_some()
    }

    /// Fail every pending call with [`RpcError::Shutdown`] and refuse new ones.
    ///
    /// Returns how many calls were failed. Safe to call more than once.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.lock();
            state.shut_down = true;
            state.pending.drain().collect()
        };
        let failed = drained.len();
        for (_, slot) in drained {
            let _ = slot.send(Err(RpcError::Shutdown));
        }
        if failed > 0 {
            debug!(failed, "failed pending calls on shutdown");
        }
        failed
    }

    /// Number of calls awaiting a reply.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    fn lock(&self) -> MutexGuard<'_, State<R>> {
        // The table stays consistent across a panic: every mutation is a single map call.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: RpcMessage> Secretary<R> {
    /// Deliver a reply to the call it answers.
    pub fn route(&self, reply: R) -> Result<(), RpcError> {
        let id = match reply.kind()? {
            RpcKind::Response(id) => id,
            RpcKind::Plain | RpcKind::Request(_) => return Err(RpcError::MissingEnvelope),
        };
        let slot = self
            .lock()
            .pending
            .remove(&id)
            .ok_or(RpcError::UnknownResponseId(id))?;

        if slot.send(Ok(reply)).is_err() {
            debug!(id, "caller went away before its reply arrived");
        }
        Ok(())
    }
}

impl<R> Default for Secretary<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> std::fmt::Debug for Secretary<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Secretary")
            .field("next_id", &state.next_id)
            .field("pending", &state.pending.len())
            .field("shut_down", &state.shut_down)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::envelope::Rpc;
    use crate::proto::{Log, LogLevel, TunnelMessage, TunnelPayload};

    fn log(text: &str, rpc: Option<Rpc>) -> TunnelMessage {
        TunnelMessage {
            rpc,
            msg: TunnelPayload::Log(Log::new(LogLevel::Info, text)),
        }
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let secretary = Secretary::<TunnelMessage>::new();
        let ids: Vec<u64> = (0..5).map(|_| secretary.record().unwrap().0).collect();
        assert_eq!(ids, [1, 2, 3, 4, 5]);
        assert_eq!(secretary.pending(), 5);
    }

    #[test]
    fn ids_are_not_reused_after_erase() {
        let secretary = Secretary::<TunnelMessage>::new();
        let (first, _rx) = secretary.record().unwrap();
        assert!(secretary.erase(first));
        assert!(!secretary.erase(first));
        let (second, _rx) = secretary.record().unwrap();
        assert_eq!(second, first + 1);
    }

    #[tokio::test]
    async fn route_resolves_matching_slot() {
        let secretary = Secretary::<TunnelMessage>::new();
        let (id, rx) = secretary.record().unwrap();

        secretary.route(log("pong", Some(Rpc::response(id)))).unwrap();
        assert_eq!(secretary.pending(), 0);

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply, log("pong", Some(Rpc::response(id))));
    }

    #[test]
    fn route_rejects_unknown_id() {
        let secretary = Secretary::<TunnelMessage>::new();
        let (_id, _rx) = secretary.record().unwrap();

        let err = secretary.route(log("stray", Some(Rpc::response(999)))).unwrap_err();
        assert_eq!(err, RpcError::UnknownResponseId(999));
        assert_eq!(secretary.pending(), 1);
    }

    #[test]
    fn route_requires_response_envelope() {
        let secretary = Secretary::<TunnelMessage>::new();
        assert_eq!(
            secretary.route(log("plain", None)).unwrap_err(),
            RpcError::MissingEnvelope
        );
        assert_eq!(
            secretary.route(log("request", Some(Rpc::request(1)))).unwrap_err(),
            RpcError::MissingEnvelope
        );
        let both = Rpc {
            msg_id: 1,
            response_to: 1,
        };
        assert!(matches!(
            secretary.route(log("both", Some(both))),
            Err(RpcError::InvalidEnvelope { .. })
        ));
    }

    #[test]
    fn route_to_abandoned_call_still_clears_slot() {
        let secretary = Secretary::<TunnelMessage>::new();
        let (id, rx) = secretary.record().unwrap();
        drop(rx);
        secretary.route(log("late", Some(Rpc::response(id)))).unwrap();
        assert_eq!(secretary.pending(), 0);
    }

    #[tokio::test]
    async fn shutdown_fails_every_pending_call() {
        let secretary = Secretary::<TunnelMessage>::new();
        let slots: Vec<_> = (0..4).map(|_| secretary.record().unwrap().1).collect();

        assert_eq!(secretary.shutdown(), 4);
        assert_eq!(secretary.pending(), 0);
        assert!(secretary.is_shut_down());

        for slot in slots {
            assert_eq!(slot.await.unwrap(), Err(RpcError::Shutdown));
        }
        assert_eq!(secretary.shutdown(), 0);
    }

    #[test]
    fn record_after_shutdown_fails() {
        let secretary = Secretary::<TunnelMessage>::new();
        secretary.shutdown();
        assert!(matches!(secretary.record(), Err(RpcError::Shutdown)));
    }

    #[test]
    fn concurrent_records_get_distinct_ids() {
        let secretary = Arc::new(Secretary::<TunnelMessage>::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let secretary = Arc::clone(&secretary);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| secretary.record().unwrap().0)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 400);
        assert_eq!(ids.first(), Some(&1));
        assert_eq!(ids.last(), Some(&400));
    }
}
