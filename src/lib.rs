pub mod capture;
pub mod config;
pub mod error;
pub mod event;
pub mod history;
pub mod persist;
pub mod rpc;
pub mod service;
pub mod settings;
pub mod thumbnail;

pub use error::CommandError;
pub use service::CaptureService;
