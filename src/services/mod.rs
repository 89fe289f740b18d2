pub mod accounts;
pub mod attachments;
pub mod authenticator;
pub mod challenge_solver;
pub mod chatgpt_client;
pub mod credential_scheduler;
pub mod request_converter;
pub mod secret_store;
pub mod stream_normalizer;
pub mod turnstile;
pub mod ws_pool;

pub use authenticator::WebAuthenticator;
pub use chatgpt_client::{ChatGptClient, Session};
pub use credential_scheduler::CredentialScheduler;
pub use secret_store::SecretStore;
