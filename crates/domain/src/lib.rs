pub mod chat;
pub mod diagnosis;
pub mod error;
pub mod events;
pub mod identity;
pub mod locks;
pub mod pipeline;
pub mod ports;
pub mod util;
pub mod verification;

#[cfg(test)]
mod test_support;

pub type DomainResult<T> = Result<T, error::DomainError>;
