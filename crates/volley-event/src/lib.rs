//! Volley Event
//!
//! Publish/subscribe plumbing used by the flow orchestrator to signal
//! node progress to dependents.
//!
//! - [`Broadcaster`] fans a value out to every subscriber registered at the
//!   time of the call and hands back a [`Delivery`] that resolves once each
//!   of them has received it.
//! - [`Event`] is the tag set flow nodes emit (`sys:start`, `sys:terminated`, ...).
//! - [`EventCaster`] is the seam the execution pipeline casts events through;
//!   [`BroadcastCaster`] forwards to a broadcaster, [`NoopCaster`] drops them.

mod broadcaster;
mod caster;
mod event;

pub use broadcaster::{Broadcaster, Delivery, Subscription};
pub use caster::{BroadcastCaster, EventCaster, NoopCaster};
pub use event::Event;
