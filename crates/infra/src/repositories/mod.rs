mod memory;

pub use memory::{InMemoryChatRepository, InMemoryDiagnosisRepository, InMemoryVerificationRepository};
