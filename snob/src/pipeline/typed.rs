//! Typed stages that pass values through the request-scoped store.
//!
//! - [`output`] runs a [`Produce`] handler and stores its result.
//! - [`input`] looks up a value and feeds it to a [`Consume`] handler.
//! - [`in_out`] does both through a [`Transform`] handler.
//!
//! Before its handler runs, every typed stage checks the request's
//! cancellation signal and halts with `504` if it already fired. A missing
//! upstream value halts with `400`; that is a composition mistake, so it is
//! also reported at `error` level.

use std::any::type_name;
use std::marker::PhantomData;

use futures::future::BoxFuture;
use tracing::{debug, error};

use super::{Ctx, Middleware, Next, StageError};

/// Handler producing a value for downstream stages.
pub trait Produce<O>: Send + Sync + 'static {
    fn produce<'a>(&'a self, ctx: &'a mut Ctx) -> BoxFuture<'a, Result<O, StageError>>;
}

/// Handler consuming a value produced upstream.
pub trait Consume<I>: Send + Sync + 'static {
    fn consume<'a>(&'a self, ctx: &'a mut Ctx, input: I) -> BoxFuture<'a, Result<(), StageError>>;
}

/// Handler turning one upstream value into another.
pub trait Transform<I, O>: Send + Sync + 'static {
    fn transform<'a>(&'a self, ctx: &'a mut Ctx, input: I) -> BoxFuture<'a, Result<O, StageError>>;
}

fn halt_if_cancelled(ctx: &mut Ctx) -> bool {
    if ctx.is_cancelled() {
        debug!(method = %ctx.method(), uri = %ctx.uri(), "pipeline_request_cancelled");
        ctx.fail(StageError::Cancelled);
        return true;
    }
    false
}

fn lookup<I: Clone + Send + Sync + 'static>(ctx: &mut Ctx) -> Option<I> {
    let value = ctx.values().get::<I>().cloned();
    if value.is_none() {
        error!(value_type = type_name::<I>(), "pipeline_missing_value");
        ctx.fail(StageError::MissingValue(type_name::<I>()));
    }
    value
}

// =============================================================================
// Output
// =============================================================================

pub struct Output<O, H> {
    handler: H,
    _marker: PhantomData<fn() -> O>,
}

pub fn output<O, H>(handler: H) -> Output<O, H>
where
    O: Clone + Send + Sync + 'static,
    H: Produce<O>,
{
    Output {
        handler,
        _marker: PhantomData,
    }
}

impl<O, H> Middleware for Output<O, H>
where
    O: Clone + Send + Sync + 'static,
    H: Produce<O>,
{
    fn call<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if halt_if_cancelled(ctx) {
                return;
            }
            match self.handler.produce(ctx).await {
                Ok(value) => {
                    ctx.values_mut().insert(value);
                    next.run(ctx).await;
                }
                Err(err) => ctx.fail(err),
            }
        })
    }
}

// =============================================================================
// Input
// =============================================================================

pub struct Input<I, H> {
    handler: H,
    _marker: PhantomData<fn(I)>,
}

pub fn input<I, H>(handler: H) -> Input<I, H>
where
    I: Clone + Send + Sync + 'static,
    H: Consume<I>,
{
    Input {
        handler,
        _marker: PhantomData,
    }
}

impl<I, H> Middleware for Input<I, H>
where
    I: Clone + Send + Sync + 'static,
    H: Consume<I>,
{
    fn call<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if halt_if_cancelled(ctx) {
                return;
            }
            let Some(value) = lookup::<I>(ctx) else {
                return;
            };
            match self.handler.consume(ctx, value).await {
                Ok(()) => next.run(ctx).await,
                Err(err) => ctx.fail(err),
            }
        })
    }
}

// =============================================================================
// InOut
// =============================================================================

pub struct InOut<I, O, H> {
    handler: H,
    _marker: PhantomData<fn(I) -> O>,
}

pub fn in_out<I, O, H>(handler: H) -> InOut<I, O, H>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    H: Transform<I, O>,
{
    InOut {
        handler,
        _marker: PhantomData,
    }
}

impl<I, O, H> Middleware for InOut<I, O, H>
where
    I: Clone + Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
    H: Transform<I, O>,
{
    fn call<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if halt_if_cancelled(ctx) {
                return;
            }
            let Some(value) = lookup::<I>(ctx) else {
                return;
            };
            match self.handler.transform(ctx, value).await {
                Ok(out) => {
                    ctx.values_mut().insert(out);
                    next.run(ctx).await;
                }
                Err(err) => ctx.fail(err),
            }
        })
    }
}
