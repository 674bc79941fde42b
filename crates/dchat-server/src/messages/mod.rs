//! Message persistence for the delivery server
//!
//! The real-time hub persists chats and read flags through its
//! `MessageStore` interface; [`MessageRepository`] implements it on top of
//! the libSQL `messages` table.

mod repository;

pub use repository::MessageRepository;
