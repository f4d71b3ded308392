pub mod assembler;
pub mod chunk_store;
pub mod file_storage;
pub mod registry;
pub mod sweeper;
pub mod upload_service;
