pub mod cert;
pub mod codec;
pub mod connmgr;
pub mod crypto;
pub mod daemon;
pub mod firewall;
pub mod hostmap;
pub mod inbound;
pub mod lighthouse;
pub mod session;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
