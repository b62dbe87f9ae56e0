//! Integration tests for the crawldash connection core
//! These run the real reqwest client against mockito and the real WebSocket
//! transport against a local tokio-tungstenite server.

pub mod harness;

mod channel_test;
mod session_test;
