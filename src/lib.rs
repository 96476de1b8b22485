pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod ext;
pub mod names;
pub mod pod_runner;
pub mod quantity;
pub mod retry;
pub mod scaler;
pub mod secrets;
pub mod upgrade;
pub mod volumes;
