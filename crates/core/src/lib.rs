//! Core library: repository reading, chunking, vector indexing and question
//! answering.

pub mod config;
pub mod docstore;
pub mod document;
pub mod embeddings;
pub mod index;
pub mod node_parser;
pub mod parser;
pub mod pipeline;
pub mod query;
pub mod reader;
