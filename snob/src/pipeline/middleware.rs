//! Reusable stages: method and content-type filters, JSON decode/encode,
//! and a fixed text response.

use std::marker::PhantomData;

use axum::http::header::{ALLOW, CONTENT_TYPE};
use axum::http::{HeaderValue, Method, StatusCode};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{Consume, Ctx, Middleware, Next, Produce, StageError};

// =============================================================================
// Filters
// =============================================================================

/// Halts with `405 Method Not Allowed` unless the method is allowed.
pub struct AllowMethods {
    allowed: Vec<Method>,
    allow_header: Option<HeaderValue>,
}

pub fn allow_methods(methods: impl IntoIterator<Item = Method>) -> AllowMethods {
    let allowed: Vec<Method> = methods.into_iter().collect();
    let joined = allowed
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    AllowMethods {
        allow_header: HeaderValue::from_str(&joined).ok(),
        allowed,
    }
}

impl Middleware for AllowMethods {
    fn call<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.allowed.contains(ctx.method()) {
                return next.run(ctx).await;
            }

            let method = ctx.method().clone();
            debug!(method = %method, uri = %ctx.uri(), "pipeline_method_rejected");
            if let Some(allow) = &self.allow_header {
                ctx.reply_mut().insert_header(ALLOW, allow.clone());
            }
            ctx.fail(StageError::MethodNotAllowed(method));
        })
    }
}

/// Halts with `415 Unsupported Media Type` unless the request's media type
/// matches. Parameters such as `charset` are ignored.
pub struct AllowContentType {
    media_type: String,
}

pub fn allow_content_type(media_type: impl Into<String>) -> AllowContentType {
    AllowContentType {
        media_type: media_type.into(),
    }
}

/// Media type of a Content-Type value, without parameters.
fn media_type_of(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or_default().trim()
}

impl Middleware for AllowContentType {
    fn call<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let provided = ctx.header(CONTENT_TYPE.as_str()).map(str::to_owned);
            let matches = provided
                .as_deref()
                .map(|v| media_type_of(v).eq_ignore_ascii_case(&self.media_type))
                .unwrap_or(false);

            if matches {
                return next.run(ctx).await;
            }

            debug!(
                content_type = ?provided,
                expected = %self.media_type,
                "pipeline_content_type_rejected"
            );
            ctx.fail(StageError::UnsupportedMediaType(provided));
        })
    }
}

// =============================================================================
// JSON
// =============================================================================

/// Decodes the buffered body as `T`.
pub struct DecodeJson<T>(PhantomData<fn() -> T>);

pub fn decode_json<T>() -> DecodeJson<T> {
    DecodeJson(PhantomData)
}

impl<T> Produce<T> for DecodeJson<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn produce<'a>(&'a self, ctx: &'a mut Ctx) -> BoxFuture<'a, Result<T, StageError>> {
        Box::pin(async move {
            let body = ctx.body_bytes().await?;
            serde_json::from_slice(&body).map_err(|e| {
                debug!(error = %e, body_length = body.len(), "pipeline_decode_failed");
                StageError::Decode(e)
            })
        })
    }
}

/// Writes the value as the JSON response body.
pub struct EncodeJson<T>(PhantomData<fn(T)>);

pub fn encode_json<T>() -> EncodeJson<T> {
    EncodeJson(PhantomData)
}

impl<T> Consume<T> for EncodeJson<T>
where
    T: Serialize + Send + 'static,
{
    fn consume<'a>(&'a self, ctx: &'a mut Ctx, input: T) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin(async move {
            let body = serde_json::to_vec(&input).map_err(|e| StageError::Encode(e.to_string()))?;
            let reply = ctx.reply_mut();
            reply.insert_header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/json; charset=utf-8"),
            );
            reply.write(&body);
            Ok(())
        })
    }
}

// =============================================================================
// Fixed response
// =============================================================================

/// Writes a fixed status and text body, then continues.
pub struct RespondText {
    status: StatusCode,
    body: &'static str,
}

pub fn respond_text(status: StatusCode, body: &'static str) -> RespondText {
    RespondText { status, body }
}

impl Middleware for RespondText {
    fn call<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            ctx.respond(self.status, self.body);
            next.run(ctx).await;
        })
    }
}
