//! Interceptor chain.
//!
//! Interceptors wrap a call in onion order: the first registered runs first
//! and sees the result last. Two levels exist:
//!
//! - [`Interceptor`] runs before the physical request is built and sees the
//!   logical [`Call`].
//! - [`ClientInterceptor`] runs after the request is built and may rewrite
//!   the [`OutboundRequest`].
//!
//! Each interceptor gets a single-use continuation ([`Next`] or
//! [`ClientNext`]) that accepts overrides merged into what the next stage
//! sees. Not calling it short-circuits the chain.
//!
//! Errors yielded by a stream after the call returned cannot unwind through
//! the interceptors, so the chain replays them: client interceptors in
//! reverse order, then interceptors in reverse order, each with a
//! continuation that immediately fails with the error.

use std::{future::Future, sync::Arc, time::Instant};

use async_trait::async_trait;
use futures_util::{StreamExt, future::BoxFuture};
use tracing::{Level, trace, warn};

use crate::{
    call::{Call, CallOverrides, OutboundRequest, Output, RequestOverrides},
    error::{RpcError, RpcResult},
    sse::ValueStream,
};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Wraps a call before the physical request exists.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    async fn intercept(&self, call: Call, next: Next) -> RpcResult<Output>;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        "interceptor"
    }
}

/// Wraps a call once the physical request has been built.
#[async_trait]
pub trait ClientInterceptor: Send + Sync + 'static {
    async fn intercept(
        &self,
        call: Call,
        request: OutboundRequest,
        next: ClientNext,
    ) -> RpcResult<Output>;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        "client_interceptor"
    }
}

/// Ordered interceptor lists for one link.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
    client_interceptors: Vec<Arc<dyn ClientInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor.
    #[must_use]
    pub fn with(mut self, interceptor: impl Interceptor) -> Self {
        self.push(interceptor);
        self
    }

    /// Append a client interceptor.
    #[must_use]
    pub fn with_client(mut self, interceptor: impl ClientInterceptor) -> Self {
        self.push_client(interceptor);
        self
    }

    pub fn push(&mut self, interceptor: impl Interceptor) {
        self.interceptors.push(Arc::new(interceptor));
    }

    pub fn push_client(&mut self, interceptor: impl ClientInterceptor) {
        self.client_interceptors.push(Arc::new(interceptor));
    }

    pub fn len(&self) -> usize {
        self.interceptors.len() + self.client_interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Interceptor names in registration order, client interceptors last.
    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors
            .iter()
            .map(|i| i.name())
            .chain(self.client_interceptors.iter().map(|i| i.name()))
            .collect()
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("interceptors", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Continuations
// ---------------------------------------------------------------------------

enum Target {
    Forward {
        pipeline: Arc<Pipeline>,
        index: usize,
    },
    /// Error replay: fail without touching the network.
    Raise(RpcError),
}

/// Continuation handed to an [`Interceptor`]. Consumed when run.
pub struct Next {
    call: Call,
    target: Target,
}

impl Next {
    /// The call the continuation will forward.
    pub fn call(&self) -> &Call {
        &self.call
    }

    /// Run the rest of the chain unchanged.
    pub fn run(self) -> BoxFuture<'static, RpcResult<Output>> {
        self.run_with(CallOverrides::default())
    }

    /// Run the rest of the chain with overrides applied.
    pub fn run_with(self, overrides: CallOverrides) -> BoxFuture<'static, RpcResult<Output>> {
        let call = self.call.apply(overrides);
        match self.target {
            Target::Forward { pipeline, index } => pipeline.dispatch(index, call),
            Target::Raise(err) => Box::pin(async move { Err(err) }),
        }
    }
}

/// Continuation handed to a [`ClientInterceptor`]. Consumed when run.
pub struct ClientNext {
    call: Call,
    request: OutboundRequest,
    target: Target,
}

impl ClientNext {
    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn request(&self) -> &OutboundRequest {
        &self.request
    }

    /// Run the rest of the chain unchanged.
    pub fn run(self) -> BoxFuture<'static, RpcResult<Output>> {
        self.run_with(CallOverrides::default(), RequestOverrides::default())
    }

    /// Run the rest of the chain with call and request overrides applied.
    pub fn run_with(
        self,
        overrides: CallOverrides,
        request: RequestOverrides,
    ) -> BoxFuture<'static, RpcResult<Output>> {
        let call = self.call.apply(overrides);
        let request = self.request.apply(request);
        match self.target {
            Target::Forward { pipeline, index } => pipeline.dispatch_client(index, call, request),
            Target::Raise(err) => Box::pin(async move { Err(err) }),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The link-specific end of the chain.
#[async_trait]
pub(crate) trait Terminal: Send + Sync + 'static {
    /// Build the physical request for a call.
    async fn materialize(&self, call: &Call) -> RpcResult<OutboundRequest>;

    /// Send the request.
    async fn execute(&self, call: Call, request: OutboundRequest) -> RpcResult<Output>;
}

/// An interceptor chain bound to a terminal.
pub(crate) struct Pipeline {
    chain: InterceptorChain,
    terminal: Box<dyn Terminal>,
}

impl Pipeline {
    pub(crate) fn new(chain: InterceptorChain, terminal: impl Terminal) -> Arc<Self> {
        Arc::new(Self {
            chain,
            terminal: Box::new(terminal),
        })
    }

    /// Run a call through every interceptor and the terminal.
    ///
    /// Errors leaving the chain are marked as notified. Streams are wrapped
    /// so their first error is replayed through the interceptors.
    pub(crate) async fn run(self: &Arc<Self>, call: Call) -> RpcResult<Output> {
        let result = Arc::clone(self).dispatch(0, call.clone()).await;
        if self.chain.is_empty() {
            return result;
        }

        match result {
            Ok(Output::Stream(stream)) => Ok(Output::Stream(self.observe(stream, call))),
            Err(mut err) => {
                err.mark_notified();
                Err(err)
            }
            other => other,
        }
    }

    fn dispatch(self: Arc<Self>, index: usize, call: Call) -> BoxFuture<'static, RpcResult<Output>> {
        Box::pin(async move {
            if let Some(interceptor) = self.chain.interceptors.get(index).cloned() {
                trace!(interceptor = interceptor.name(), call = %call.id, "Running interceptor");
                let next = Next {
                    call: call.clone(),
                    target: Target::Forward {
                        pipeline: self,
                        index: index + 1,
                    },
                };
                return interceptor.intercept(call, next).await;
            }

            let request = self.terminal.materialize(&call).await?;
            self.dispatch_client(0, call, request).await
        })
    }

    fn dispatch_client(
        self: Arc<Self>,
        index: usize,
        call: Call,
        request: OutboundRequest,
    ) -> BoxFuture<'static, RpcResult<Output>> {
        Box::pin(async move {
            if let Some(interceptor) = self.chain.client_interceptors.get(index).cloned() {
                trace!(interceptor = interceptor.name(), call = %call.id, "Running client interceptor");
                let next = ClientNext {
                    call: call.clone(),
                    request: request.clone(),
                    target: Target::Forward {
                        pipeline: self,
                        index: index + 1,
                    },
                };
                return interceptor.intercept(call, request, next).await;
            }

            self.terminal.execute(call, request).await
        })
    }

    fn observe(self: &Arc<Self>, stream: ValueStream, call: Call) -> ValueStream {
        let pipeline = Arc::clone(self);
        stream.wrap(move |inner| {
            inner.then(move |item| {
                let pipeline = Arc::clone(&pipeline);
                let call = call.clone();
                async move {
                    match item {
                        Err(mut err) if !err.is_notified() => {
                            err.mark_notified();
                            pipeline.replay_error(&call, &err).await;
                            Err(err)
                        }
                        other => other,
                    }
                }
            })
        })
    }

    /// Show a stream error to every interceptor, innermost first.
    async fn replay_error(&self, call: &Call, err: &RpcError) {
        for interceptor in self.chain.client_interceptors.iter().rev() {
            let request = match self.terminal.materialize(call).await {
                Ok(request) => request,
                Err(e) => {
                    warn!(interceptor = interceptor.name(), error = %e, "Cannot rebuild request for error replay");
                    continue;
                }
            };
            let next = ClientNext {
                call: call.clone(),
                request: request.clone(),
                target: Target::Raise(err.clone()),
            };
            let outcome = interceptor.intercept(call.clone(), request, next).await;
            report_replay(interceptor.name(), err, outcome);
        }

        for interceptor in self.chain.interceptors.iter().rev() {
            let next = Next {
                call: call.clone(),
                target: Target::Raise(err.clone()),
            };
            let outcome = interceptor.intercept(call.clone(), next).await;
            report_replay(interceptor.name(), err, outcome);
        }
    }
}

fn report_replay(name: &'static str, original: &RpcError, outcome: RpcResult<Output>) {
    if let Err(raised) = outcome
        && !raised.same_failure(original)
    {
        warn!(
            interceptor = name,
            error = %raised,
            original = %original,
            "Interceptor raised a different error while handling a stream error"
        );
    }
}

// ---------------------------------------------------------------------------
// Closure interceptors
// ---------------------------------------------------------------------------

/// Interceptor backed by an async closure.
pub struct FnInterceptor<F> {
    name: &'static str,
    f: F,
}

/// Build an [`Interceptor`] from `|call, next| async { .. }`.
pub fn interceptor_fn<F, Fut>(name: &'static str, f: F) -> FnInterceptor<F>
where
    F: Fn(Call, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Output>> + Send + 'static,
{
    FnInterceptor { name, f }
}

#[async_trait]
impl<F, Fut> Interceptor for FnInterceptor<F>
where
    F: Fn(Call, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Output>> + Send + 'static,
{
    async fn intercept(&self, call: Call, next: Next) -> RpcResult<Output> {
        (self.f)(call, next).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Client interceptor backed by an async closure.
pub struct FnClientInterceptor<F> {
    name: &'static str,
    f: F,
}

/// Build a [`ClientInterceptor`] from `|call, request, next| async { .. }`.
pub fn client_interceptor_fn<F, Fut>(name: &'static str, f: F) -> FnClientInterceptor<F>
where
    F: Fn(Call, OutboundRequest, ClientNext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Output>> + Send + 'static,
{
    FnClientInterceptor { name, f }
}

#[async_trait]
impl<F, Fut> ClientInterceptor for FnClientInterceptor<F>
where
    F: Fn(Call, OutboundRequest, ClientNext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Output>> + Send + 'static,
{
    async fn intercept(
        &self,
        call: Call,
        request: OutboundRequest,
        next: ClientNext,
    ) -> RpcResult<Output> {
        (self.f)(call, request, next).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

// ---------------------------------------------------------------------------
// Observer helpers
// ---------------------------------------------------------------------------

/// Implements both interceptor levels for a callback wrapper.
macro_rules! observer {
    ($ty:ident, [$($bound:tt)+], $name:literal, |$callback:ident, $call:ident, $run:ident| $body:block) => {
        #[async_trait]
        impl<F> Interceptor for $ty<F>
        where
            F: $($bound)+ + Send + Sync + 'static,
        {
            async fn intercept(&self, $call: Call, next: Next) -> RpcResult<Output> {
                let $callback = &self.0;
                let $run = next.run();
                $body
            }

            fn name(&self) -> &'static str {
                $name
            }
        }

        #[async_trait]
        impl<F> ClientInterceptor for $ty<F>
        where
            F: $($bound)+ + Send + Sync + 'static,
        {
            async fn intercept(
                &self,
                $call: Call,
                _request: OutboundRequest,
                next: ClientNext,
            ) -> RpcResult<Output> {
                let $callback = &self.0;
                let $run = next.run();
                $body
            }

            fn name(&self) -> &'static str {
                $name
            }
        }
    };
}

/// Calls back before the rest of the chain runs.
pub struct OnStart<F>(F);

/// Calls back when the rest of the chain succeeds.
pub struct OnSuccess<F>(F);

/// Calls back when the rest of the chain fails, including stream errors.
pub struct OnError<F>(F);

/// Calls back with the outcome either way.
pub struct OnFinish<F>(F);

pub fn on_start<F: Fn(&Call) + Send + Sync + 'static>(callback: F) -> OnStart<F> {
    OnStart(callback)
}

pub fn on_success<F: Fn(&Output) + Send + Sync + 'static>(callback: F) -> OnSuccess<F> {
    OnSuccess(callback)
}

pub fn on_error<F: Fn(&RpcError) + Send + Sync + 'static>(callback: F) -> OnError<F> {
    OnError(callback)
}

pub fn on_finish<F>(callback: F) -> OnFinish<F>
where
    F: Fn(Result<&Output, &RpcError>) + Send + Sync + 'static,
{
    OnFinish(callback)
}

observer!(OnStart, [Fn(&Call)], "on_start", |callback, call, run| {
    callback(&call);
    run.await
});

observer!(OnSuccess, [Fn(&Output)], "on_success", |callback, _call, run| {
    let result = run.await;
    if let Ok(output) = &result {
        callback(output);
    }
    result
});

observer!(OnError, [Fn(&RpcError)], "on_error", |callback, _call, run| {
    let result = run.await;
    if let Err(err) = &result {
        callback(err);
    }
    result
});

observer!(OnFinish, [Fn(Result<&Output, &RpcError>)], "on_finish", |callback, _call, run| {
    let result = run.await;
    callback(result.as_ref());
    result
});

// ---------------------------------------------------------------------------
// LoggingInterceptor
// ---------------------------------------------------------------------------

/// Logs every call with its duration.
///
/// Failures are always logged at `WARN`.
pub struct LoggingInterceptor {
    level: Level,
}

impl LoggingInterceptor {
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    pub fn info() -> Self {
        Self::new(Level::INFO)
    }

    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl Default for LoggingInterceptor {
    fn default() -> Self {
        Self::debug()
    }
}

macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        if $level == Level::ERROR {
            tracing::error!($($arg)+);
        } else if $level == Level::WARN {
            tracing::warn!($($arg)+);
        } else if $level == Level::INFO {
            tracing::info!($($arg)+);
        } else if $level == Level::DEBUG {
            tracing::debug!($($arg)+);
        } else {
            tracing::trace!($($arg)+);
        }
    };
}

#[async_trait]
impl Interceptor for LoggingInterceptor {
    async fn intercept(&self, call: Call, next: Next) -> RpcResult<Output> {
        let path = call.path_string();
        let started = Instant::now();
        log_at!(self.level, call = %call.id, path = %path, stream = call.wants_stream(), "Sending call");

        let result = next.run().await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(output) => {
                log_at!(self.level, call = %call.id, path = %path, duration_ms, stream = output.is_stream(), "Call succeeded");
            }
            Err(err) => {
                warn!(call = %call.id, path = %path, duration_ms, code = %err.code(), error = %err, "Call failed");
            }
        }
        result
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}
