//! Actor runtime for the allocator.
//!
//! ## Design Principles
//!
//! - **Single owner**: one actor owns all allocator state, so every mutation
//!   happens on one logical thread in mailbox order
//! - **Fire-and-forget mutators**: callers enqueue and return immediately;
//!   queries carry a oneshot reply channel
//! - **Deferred work**: timers and slow collaborators report back by message
//!   instead of blocking the loop

mod framework;

pub use framework::{
    spawn, Actor, ActorContext, ActorError, ActorHandle, ActorRef, ActorState, Message,
    TimerHandle,
};
