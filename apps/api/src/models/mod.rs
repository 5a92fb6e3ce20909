pub mod chat;
pub mod chunk;
pub mod deployment;
pub mod document;
pub mod portal;
