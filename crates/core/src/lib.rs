#[macro_use]
extern crate tracing;

#[macro_use]
mod mac;

pub mod buf;
pub mod cnf;
pub mod ctx;
pub mod err;
pub mod exe;
pub mod join;
pub mod phy;
pub mod plan;
pub mod sch;
pub mod win;
pub mod wire;

#[doc(hidden)]
/// Channels used for staging areas and buffer awaiter handoff
pub mod channel {
	pub use channel::bounded;
	pub use channel::unbounded;
	pub use channel::Receiver;
	pub use channel::Sender;
}
