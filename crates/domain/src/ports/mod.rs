use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod ai;
pub mod chat;
pub mod diagnosis;
pub mod files;
pub mod notify;
pub mod verification;
