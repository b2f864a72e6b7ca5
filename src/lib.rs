//! bods - pipe text, images and PDFs to Claude on Amazon Bedrock
//!
//! The binary reads stdin, builds the first user message, streams the
//! response to stdout and, when the text editor tool is enabled, answers the
//! model's file edit requests until it is done.

pub mod cli;
pub mod client;
pub mod config;
pub mod content;
pub mod controller;
pub mod editor;
pub mod error;
pub mod eventstream;
pub mod logging;
pub mod media;
pub mod messages;
pub mod models;
pub mod pasteboard;
pub mod profile;
pub mod render;
pub mod stream;

pub use error::BodsError;
