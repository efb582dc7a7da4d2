//! Multiplexed request/response calls over one duplex byte stream
//!
//! The client tags each request with a fresh call id and parks a oneshot
//! sender under it; a single reader task routes responses back by id, so any
//! number of calls can be outstanding and may complete in any order. A single
//! writer task owns the write half, which keeps frames whole even when the
//! caller that queued them has already given up.

use crate::error::{RemoteError, TakiError};
use crate::protocol::frame;
use crate::protocol_core::{decode, encode, read_frame, write_frame, Frame};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Reply = Result<Vec<u8>, TakiError>;

#[derive(Default)]
struct PendingCalls {
    /// Set once the stream is unusable; new calls fail immediately
    closed: Option<String>,
    calls: HashMap<u64, oneshot::Sender<Reply>>,
}

impl PendingCalls {
    fn close(&mut self, reason: String) {
        for (_, tx) in self.calls.drain() {
            let _ = tx.send(Err(TakiError::Protocol(reason.clone())));
        }
        self.closed.get_or_insert(reason);
    }
}

pub struct RpcClient {
    next_id: AtomicU64,
    pending: Arc<Mutex<PendingCalls>>,
    outgoing: mpsc::UnboundedSender<Frame>,
    reader: JoinHandle<()>,
}

impl RpcClient {
    /// Take over both halves of an established (post-handshake) stream.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = Arc::new(Mutex::new(PendingCalls::default()));
        let (outgoing, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(reader, Arc::clone(&pending)));
        tokio::spawn(write_loop(writer, rx, Arc::clone(&pending)));
        RpcClient {
            next_id: AtomicU64::new(1),
            pending,
            outgoing,
            reader,
        }
    }

    /// Issue `method` and wait for its response or for `cancel`.
    ///
    /// Cancelling only abandons this call; the channel and other calls carry
    /// on, and a late response for it is dropped.
    pub async fn call<Req, Res>(
        &self,
        method: &str,
        req: &Req,
        cancel: &CancellationToken,
    ) -> Result<Res, TakiError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let payload = encode(req)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if let Some(reason) = &pending.closed {
                return Err(TakiError::Protocol(reason.clone()));
            }
            pending.calls.insert(id, tx);
        }

        let request = Frame {
            kind: frame::REQUEST,
            id,
            method: method.to_string(),
            payload,
        };
        if self.outgoing.send(request).is_err() {
            self.pending.lock().calls.remove(&id);
            return Err(TakiError::protocol("channel writer stopped"));
        }

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.pending.lock().calls.remove(&id);
                return Err(TakiError::Cancelled);
            }
            reply = rx => reply,
        };
        match reply {
            Ok(Ok(bytes)) => decode(&bytes),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TakiError::protocol("channel closed")),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed.is_some()
    }

    /// Number of calls still waiting for a response
    pub fn in_flight(&self) -> usize {
        self.pending.lock().calls.len()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        // The writer stops on its own once `outgoing` is gone
        self.reader.abort();
    }
}

async fn read_loop<R>(mut reader: R, pending: Arc<Mutex<PendingCalls>>)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "channel closed by agent".to_string(),
            Err(e) => break format!("channel read failed: {e}"),
        };
        let reply = match frame.kind {
            frame::RESPONSE => Ok(frame.payload),
            frame::ERROR => match decode::<RemoteError>(&frame.payload) {
                Ok(remote) => Err(TakiError::from(remote)),
                Err(e) => Err(e),
            },
            other => break format!("unexpected frame kind {other} from agent"),
        };
        // Unknown ids belong to cancelled calls
        if let Some(tx) = pending.lock().calls.remove(&frame.id) {
            let _ = tx.send(reply);
        }
    };
    pending.lock().close(reason);
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    pending: Arc<Mutex<PendingCalls>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            pending.lock().close(format!("channel write failed: {e}"));
            return;
        }
    }
}

type Handler<S> = Box<dyn Fn(Arc<S>, Vec<u8>) -> BoxFuture<'static, Reply> + Send + Sync>;

/// Static method table: `service.method` name to typed handler.
pub struct Router<S> {
    handlers: HashMap<&'static str, Handler<S>>,
}

impl<S: Send + Sync + 'static> Default for Router<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Send + Sync + 'static> Router<S> {
    pub fn new() -> Self {
        Router {
            handlers: HashMap::new(),
        }
    }

    pub fn route<Req, Res, F, Fut>(mut self, method: &'static str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(Arc<S>, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, TakiError>> + Send + 'static,
    {
        let boxed: Handler<S> = Box::new(move |state, payload| {
            let call = decode::<Req>(&payload).map(|req| handler(state, req));
            async move {
                let res = call?.await?;
                encode(&res)
            }
            .boxed()
        });
        self.handlers.insert(method, boxed);
        self
    }

    pub fn methods(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub async fn dispatch(&self, state: Arc<S>, method: &str, payload: Vec<u8>) -> Reply {
        match self.handlers.get(method) {
            Some(handler) => handler(state, payload).await,
            None => Err(TakiError::protocol(format!("unknown method {method}"))),
        }
    }
}

/// Serve requests until the peer closes its end. Each request runs on its
/// own task so slow calls never hold up quick ones.
pub async fn serve<S, R, W>(
    router: Arc<Router<S>>,
    state: Arc<S>,
    mut reader: R,
    writer: W,
) -> Result<(), TakiError>
where
    S: Send + Sync + 'static,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = rx.recv().await {
            write_frame(&mut writer, &frame).await?;
        }
        Ok::<(), TakiError>(())
    });

    let result = loop {
        let request = match read_frame(&mut reader).await {
            Ok(Some(f)) if f.kind == frame::REQUEST => f,
            Ok(Some(f)) => {
                break Err(TakiError::protocol(format!(
                    "unexpected frame kind {} from operator",
                    f.kind
                )))
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        let router = Arc::clone(&router);
        let state = Arc::clone(&state);
        let tx = tx.clone();
        tokio::spawn(async move {
            let Frame {
                id,
                method,
                payload,
                ..
            } = request;
            let reply = match router.dispatch(state, &method, payload).await {
                Ok(payload) => Frame {
                    kind: frame::RESPONSE,
                    id,
                    method: String::new(),
                    payload,
                },
                Err(e) => Frame {
                    kind: frame::ERROR,
                    id,
                    method: String::new(),
                    payload: encode(&RemoteError::from(&e)).unwrap_or_default(),
                },
            };
            let _ = tx.send(reply);
        });
    };

    // Replies still being computed keep the writer alive until they are sent
    drop(tx);
    match writer_task.await {
        Ok(Ok(())) => result,
        Ok(Err(e)) => result.and(Err(e)),
        Err(e) => Err(TakiError::protocol(format!("writer task failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct State {
        greeting: String,
    }

    fn router() -> Router<State> {
        Router::new()
            .route("Test.Echo", |s: Arc<State>, name: String| async move {
                Ok(format!("{} {}", s.greeting, name))
            })
            .route("Test.Sleep", |_, ms: u64| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ms)
            })
            .route("Test.Fail", |_, _: ()| async move {
                Err::<(), _>(TakiError::Config)
            })
    }

    fn connect() -> RpcClient {
        let (c_out, s_in) = tokio::io::duplex(64 * 1024);
        let (s_out, c_in) = tokio::io::duplex(64 * 1024);
        let state = Arc::new(State {
            greeting: "hello".into(),
        });
        tokio::spawn(serve(Arc::new(router()), state, s_in, s_out));
        RpcClient::new(c_in, c_out)
    }

    #[tokio::test]
    async fn test_basic_call() {
        let client = connect();
        let cancel = CancellationToken::new();
        let res: String = client.call("Test.Echo", "taki", &cancel).await.unwrap();
        assert_eq!(res, "hello taki");
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_responses_complete_out_of_order() {
        let client = connect();
        let cancel = CancellationToken::new();
        let slow = client.call::<u64, u64>("Test.Sleep", &300, &cancel);
        let fast = client.call::<u64, u64>("Test.Sleep", &1, &cancel);
        tokio::pin!(slow);

        let got = tokio::select! {
            biased;
            r = fast => r.unwrap(),
            _ = &mut slow => panic!("slow call finished first"),
        };
        assert_eq!(got, 1);
        assert_eq!(slow.await.unwrap(), 300);
    }

    #[tokio::test]
    async fn test_cancel_leaves_channel_usable() {
        let client = connect();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = client
            .call::<u64, u64>("Test.Sleep", &5_000, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TakiError::Cancelled));
        assert_eq!(client.in_flight(), 0);

        let res: String = client
            .call("Test.Echo", "again", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(res, "hello again");
    }

    #[tokio::test]
    async fn test_remote_error_keeps_identity() {
        let client = connect();
        let err = client
            .call::<(), ()>("Test.Fail", &(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TakiError::Config));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let client = connect();
        let err = client
            .call::<(), ()>("Test.Missing", &(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown method Test.Missing"));
    }

    #[tokio::test]
    async fn test_eof_fails_outstanding_calls() {
        let (c_out, _s_in) = tokio::io::duplex(1024);
        let (s_out, c_in) = tokio::io::duplex(1024);
        let client = Arc::new(RpcClient::new(c_in, c_out));

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call::<(), ()>("Test.Echo", &(), &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(s_out);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, TakiError::Protocol(_)));
        assert!(client.is_closed());
        let again = client
            .call::<(), ()>("Test.Echo", &(), &CancellationToken::new())
            .await;
        assert!(again.is_err());
    }

    #[test]
    fn test_router_methods() {
        assert_eq!(
            router().methods(),
            vec!["Test.Echo", "Test.Fail", "Test.Sleep"]
        );
    }
}
