pub mod message;
pub mod record;
pub mod request;

pub use message::*;
pub use record::*;
pub use request::*;
