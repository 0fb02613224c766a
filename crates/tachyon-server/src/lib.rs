pub mod crypto;
pub mod handlers;
pub mod hasher;
pub mod server;
pub mod service;
pub mod sign;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub notes: service::NoteService,
}

pub use server::{resolve_data_dir, router, run, ServerConfig};
pub use service::{NewNote, NoteError, NoteService, ServiceConfig};
