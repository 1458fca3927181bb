//! Interceptor chain.
//!
//! A call is processed by an ordered list of [`Stage`]s ending in a terminal
//! [`Handler`]. Each stage receives the continuation [`Next`] and decides
//! whether and when to run it: it may rewrite the request, inspect or
//! replace the result, return early, or run the continuation more than once.
//!
//! The same machinery is used on both sides of an RPC. On the serving side
//! the terminal dispatches to the local plugin services; on the calling side
//! it issues the call over a transport channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tonic::Status;

use crate::context::CallContext;
use crate::message::{CsiRequest, CsiResponse};

/// Outcome of a call at any point in the chain.
pub type CallResult = Result<CsiResponse, Status>;

type CallFuture<'a> = Pin<Box<dyn Future<Output = CallResult> + Send + 'a>>;

/// One interceptor in the chain.
#[tonic::async_trait]
pub trait Stage: Send + Sync {
    async fn call(&self, ctx: CallContext, request: CsiRequest, next: Next<'_>) -> CallResult;
}

/// Terminal of the chain: the local service or the outbound transport.
#[tonic::async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: CallContext, request: CsiRequest) -> CallResult;
}

/// The rest of the pipeline, as seen from inside a stage.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
    tail: Tail<'a>,
}

#[derive(Clone, Copy)]
enum Tail<'a> {
    Handler(&'a dyn Handler),
    /// Continuation of the chain a composite stage is nested in.
    Outer(&'a Next<'a>),
}

impl<'a> Next<'a> {
    /// Continuation that runs `stages` in order and then `handler`.
    pub fn new(stages: &'a [Arc<dyn Stage>], handler: &'a dyn Handler) -> Self {
        Self {
            stages,
            tail: Tail::Handler(handler),
        }
    }

    /// Run the remainder of the pipeline.
    pub fn run(self, ctx: CallContext, request: CsiRequest) -> CallFuture<'a> {
        Box::pin(async move {
            match self.stages.split_first() {
                Some((stage, rest)) => {
                    let next = Next {
                        stages: rest,
                        tail: self.tail,
                    };
                    stage.call(ctx, request, next).await
                }
                None => match self.tail {
                    Tail::Handler(handler) => handler.call(ctx, request).await,
                    Tail::Outer(outer) => (*outer).run(ctx, request).await,
                },
            }
        })
    }
}

/// Stage that only forwards to the continuation.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

#[tonic::async_trait]
impl Stage for PassThrough {
    async fn call(&self, ctx: CallContext, request: CsiRequest, next: Next<'_>) -> CallResult {
        next.run(ctx, request).await
    }
}

/// Several stages composed into one.
struct Chain {
    stages: Vec<Arc<dyn Stage>>,
}

#[tonic::async_trait]
impl Stage for Chain {
    async fn call(&self, ctx: CallContext, request: CsiRequest, next: Next<'_>) -> CallResult {
        let inner = Next {
            stages: &self.stages,
            tail: Tail::Outer(&next),
        };
        inner.run(ctx, request).await
    }
}

/// Compose `stages` into a single stage, first stage outermost.
///
/// No stages yields a pass-through and a single stage is returned as is.
pub fn chain(stages: impl IntoIterator<Item = Arc<dyn Stage>>) -> Arc<dyn Stage> {
    let mut stages: Vec<Arc<dyn Stage>> = stages.into_iter().collect();
    match stages.len() {
        0 => Arc::new(PassThrough),
        1 => stages.remove(0),
        _ => Arc::new(Chain { stages }),
    }
}

/// A composed stage bound to its terminal handler.
#[derive(Clone)]
pub struct Pipeline {
    stage: Arc<dyn Stage>,
    handler: Arc<dyn Handler>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>, handler: Arc<dyn Handler>) -> Self {
        Self {
            stage: chain(stages),
            handler,
        }
    }

    /// Run one call through the pipeline.
    pub async fn invoke(&self, ctx: CallContext, request: CsiRequest) -> CallResult {
        let next = Next::new(&[], self.handler.as_ref());
        self.stage.call(ctx, request, next).await
    }

    /// Typed wrapper around [`Pipeline::invoke`].
    pub async fn unary<Req, Resp>(&self, ctx: CallContext, request: Req) -> Result<Resp, Status>
    where
        Req: Into<CsiRequest>,
        Resp: TryFrom<CsiResponse, Error = Status>,
    {
        let response = self.invoke(ctx, request.into()).await?;
        Resp::try_from(response)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::csi;

    /// Records its pre and post logic into a shared journal.
    struct Recorder {
        name: &'static str,
        journal: Arc<Mutex<Vec<String>>>,
    }

    #[tonic::async_trait]
    impl Stage for Recorder {
        async fn call(
            &self,
            ctx: CallContext,
            request: CsiRequest,
            next: Next<'_>,
        ) -> CallResult {
            self.journal.lock().push(format!("{}:pre", self.name));
            let result = next.run(ctx, request).await;
            self.journal.lock().push(format!("{}:post", self.name));
            result
        }
    }

    struct Terminal {
        journal: Arc<Mutex<Vec<String>>>,
    }

    #[tonic::async_trait]
    impl Handler for Terminal {
        async fn call(&self, _ctx: CallContext, _request: CsiRequest) -> CallResult {
            self.journal.lock().push("handler".to_string());
            Ok(csi::ProbeResponse { ready: Some(true) }.into())
        }
    }

    /// Stage returning early without running the continuation.
    struct ShortCircuit;

    #[tonic::async_trait]
    impl Stage for ShortCircuit {
        async fn call(&self, _ctx: CallContext, _req: CsiRequest, _next: Next<'_>) -> CallResult {
            Err(Status::unavailable("short-circuited"))
        }
    }

    fn recorder(name: &'static str, journal: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Stage> {
        Arc::new(Recorder {
            name,
            journal: journal.clone(),
        })
    }

    fn probe() -> CsiRequest {
        csi::ProbeRequest::default().into()
    }

    #[tokio::test]
    async fn test_chain_order_preserved() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            vec![recorder("a", &journal), recorder("b", &journal)],
            Arc::new(Terminal {
                journal: journal.clone(),
            }),
        );

        pipeline.invoke(CallContext::new(), probe()).await.unwrap();
        assert_eq!(
            *journal.lock(),
            vec!["a:pre", "b:pre", "handler", "b:post", "a:post"]
        );
    }

    #[tokio::test]
    async fn test_empty_chain_passes_through() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            Vec::new(),
            Arc::new(Terminal {
                journal: journal.clone(),
            }),
        );

        let response = pipeline.invoke(CallContext::new(), probe()).await.unwrap();
        assert_eq!(response, csi::ProbeResponse { ready: Some(true) }.into());
        assert_eq!(*journal.lock(), vec!["handler"]);
    }

    #[test]
    fn test_single_stage_is_returned_directly() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let stage = recorder("only", &journal);
        let composed = chain(vec![stage.clone()]);
        assert!(Arc::ptr_eq(&stage, &composed));
    }

    #[tokio::test]
    async fn test_nested_chain_matches_flat_chain() {
        let flat_journal = Arc::new(Mutex::new(Vec::new()));
        let flat = Pipeline::new(
            vec![
                recorder("a", &flat_journal),
                recorder("b", &flat_journal),
                recorder("c", &flat_journal),
            ],
            Arc::new(Terminal {
                journal: flat_journal.clone(),
            }),
        );

        let nested_journal = Arc::new(Mutex::new(Vec::new()));
        let inner = chain(vec![
            recorder("b", &nested_journal),
            recorder("c", &nested_journal),
        ]);
        let nested = Pipeline::new(
            vec![recorder("a", &nested_journal), inner],
            Arc::new(Terminal {
                journal: nested_journal.clone(),
            }),
        );

        flat.invoke(CallContext::new(), probe()).await.unwrap();
        nested.invoke(CallContext::new(), probe()).await.unwrap();
        assert_eq!(*flat_journal.lock(), *nested_journal.lock());
    }

    #[tokio::test]
    async fn test_stage_can_return_early() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            vec![
                recorder("a", &journal),
                Arc::new(ShortCircuit),
                recorder("b", &journal),
            ],
            Arc::new(Terminal {
                journal: journal.clone(),
            }),
        );

        let err = pipeline.invoke(CallContext::new(), probe()).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
        assert_eq!(*journal.lock(), vec!["a:pre", "a:post"]);
    }

    #[tokio::test]
    async fn test_unary_typed_response() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(Vec::new(), Arc::new(Terminal { journal }));

        let response: csi::ProbeResponse = pipeline
            .unary(CallContext::new(), csi::ProbeRequest::default())
            .await
            .unwrap();
        assert_eq!(response.ready, Some(true));

        let mismatch: Result<csi::NodeGetInfoResponse, Status> = pipeline
            .unary(CallContext::new(), csi::NodeGetInfoRequest::default())
            .await;
        assert_eq!(mismatch.unwrap_err().code(), tonic::Code::Internal);
    }
}
