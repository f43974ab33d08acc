//! Service layer
//!
//! Contains business logic separated from HTTP handlers.
//! Services orchestrate the stores and outbound federation.

mod account;
mod note;

pub use account::AccountService;
pub use note::{NewNote, NoteService, Visibility, audience_for_visibility};
