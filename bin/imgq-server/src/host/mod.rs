//! Host adapters.

pub mod webui;
