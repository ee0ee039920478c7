pub mod event;
pub mod message;
pub mod provider;
pub mod session;
pub mod task;

pub use event::*;
pub use message::*;
pub use provider::*;
pub use session::*;
pub use task::*;
