pub mod error;
pub mod http;
pub mod realtime;
pub mod stream;

pub use error::BackendError;
pub use http::StatusClient;
pub use realtime::{PhoenixChannel, PhoenixMessage};
pub use stream::{HttpStreamTransport, LevelMeter};
