pub mod addr;
pub mod channel;
pub mod codec;
pub mod hooks;
pub mod session;
pub mod transport;
mod sentinel;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
