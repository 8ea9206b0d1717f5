pub mod account;
pub mod files;
pub mod hosting;
pub mod sandbox;
pub mod service;
pub mod settings;
pub mod utils;
