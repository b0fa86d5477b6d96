use anyhow::Result;
use futures::future::BoxFuture;
use std::sync::Arc;

pub mod document_store;
pub mod flag_store;
pub mod priority;
#[cfg(test)]
pub mod test;

pub type ThreadSafeAsyncFn<A = (), R = ()> =
  Arc<dyn Fn(A) -> BoxFuture<'static, Result<R>> + Send + Sync>;

pub fn async_callback<Fut, A, R>(f: fn(A) -> Fut) -> ThreadSafeAsyncFn<A, R>
where
  Fut: std::future::Future<Output = Result<R>> + Send + 'static,
  A: Send + 'static,
{
  Arc::new(move |arg| Box::pin(async move { f(arg).await }))
}
