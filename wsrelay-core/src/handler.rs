//! Async functions as request handlers.
//!
//! Any `async fn` whose arguments implement
//! [`FromRequest`](crate::extractor::FromRequest) and whose return type
//! implements [`IntoReply`] can be turned into a [`Handler`] with
//! [`handler()`]:
//!
//! ```
//! use wsrelay_core::handler::handler;
//! use wsrelay_core::extractor::Payload;
//! use wsrelay_core::Result;
//!
//! async fn ping() -> &'static str {
//!     "pong"
//! }
//!
//! async fn count(Payload(fields): Payload) -> Result<String> {
//!     Ok(fields.len().to_string())
//! }
//!
//! let _ping = handler(ping);
//! let _count = handler(count);
//! ```

use crate::dispatch::{Caller, IntoReply, Reply, Request};
use crate::error::Result;
use crate::extractor::FromRequest;
use crate::state::AppState;
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;

/// A type-erased request handler.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Runs the handler for one request.
    async fn call(&self, request: Request, caller: Caller, state: AppState) -> Result<Reply>;
}

/// Adapter from a function to [`Handler`].
pub struct HandlerService<F, T> {
    handler: F,
    _marker: PhantomData<fn() -> T>,
}

impl<F, T> HandlerService<F, T> {
    /// Wraps a handler function.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

/// Conversion of a function into a [`Handler`].
pub trait IntoHandler<T> {
    /// The resulting handler type.
    type Handler: Handler;

    /// Performs the conversion.
    fn into_handler(self) -> Self::Handler;
}

macro_rules! impl_handler {
    ($($ty:ident),*) => {
        #[allow(non_snake_case, unused_variables)]
        #[async_trait]
        impl<F, Fut, Res, $($ty,)*> Handler for HandlerService<F, ($($ty,)*)>
        where
            F: Fn($($ty,)*) -> Fut + Send + Sync + 'static,
            Fut: std::future::Future<Output = Res> + Send + 'static,
            Res: IntoReply,
            $( $ty: FromRequest + Send + 'static, )*
        {
            async fn call(&self, request: Request, caller: Caller, state: AppState) -> Result<Reply> {
                $(
                    let $ty = $ty::from_request(&request, &caller, &state).await?;
                )*

                (self.handler)($($ty,)*).await.into_reply()
            }
        }

        impl<F, Fut, Res, $($ty,)*> IntoHandler<($($ty,)*)> for F
        where
            F: Fn($($ty,)*) -> Fut + Send + Sync + 'static,
            Fut: std::future::Future<Output = Res> + Send + 'static,
            Res: IntoReply,
            $( $ty: FromRequest + Send + 'static, )*
        {
            type Handler = HandlerService<F, ($($ty,)*)>;

            fn into_handler(self) -> Self::Handler {
                HandlerService::new(self)
            }
        }
    };
}

impl_handler!();
impl_handler!(T1);
impl_handler!(T1, T2);
impl_handler!(T1, T2, T3);
impl_handler!(T1, T2, T3, T4);

/// Turns a function into a shareable [`Handler`].
pub fn handler<F, T>(f: F) -> Arc<dyn Handler>
where
    F: IntoHandler<T>,
{
    Arc::new(f.into_handler())
}
