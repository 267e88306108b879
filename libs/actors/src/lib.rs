//! Supervised Actor Runtime
//!
//! Actors are isolated units of sequential computation reachable only through
//! their mailbox. Each actor runs as one tokio task, processes one message at
//! a time, and is supervised by the actor that spawned it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ ActorSystem                                  │
//! │   /user (guardian)                           │
//! │     ├── counter      ActorRef<CounterCmd>    │
//! │     └── room         ActorRef<RoomCmd>       │
//! │           ├── alice  (restarted by room)     │
//! │           └── bob                            │
//! └──────────────────────────────────────────────┘
//!          │ tell / ask          ▲ reply
//!          ▼                     │
//!   [signals]──biased──►[handle(ctx, msg)]──► Next::{Same, Become, Stop}
//!   [user msgs]─────────┘
//! ```
//!
//! # Examples
//!
//! ```rust,no_run
//! use actors::{from_fn, ActorSystem, Next, Props, ReplyTo};
//! use std::time::Duration;
//!
//! enum Cmd {
//!     Add(i64),
//!     Get(ReplyTo<i64>),
//! }
//!
//! # async fn demo() -> actors::Result<()> {
//! let system = ActorSystem::new("demo");
//! let props = Props::new(|| {
//!     let mut total = 0;
//!     from_fn(move |_ctx, msg: Cmd| {
//!         match msg {
//!             Cmd::Add(n) => total += n,
//!             Cmd::Get(reply) => {
//!                 reply.send(total);
//!             }
//!         }
//!         Ok(Next::Same)
//!     })
//! });
//! let adder = system.spawn("adder", props)?;
//! adder.tell(Cmd::Add(2))?;
//! let total = adder.ask(Cmd::Get, Duration::from_secs(1)).await?;
//! assert_eq!(total, 2);
//! # Ok(())
//! # }
//! ```

pub mod behavior;
pub mod context;
pub mod error;
pub mod messages;
pub mod registry;
pub mod supervision;
pub mod system;

pub use behavior::{from_fn, ActorBehavior, FnBehavior, Next, Props};
pub use context::ActorContext;
pub use error::{ActorError, ErrorClass, Result};
pub use messages::{respond, CorrelationId, Message, ReplyTo, Request};
pub use registry::{ActorId, ActorPath};
pub use supervision::{SupervisorDirective, SupervisorStrategy};
pub use system::{ActorRef, ActorStatus, ActorSystem, SystemMetrics, SystemSettings, SystemStats};

/// Re-exported so behaviors can implement [`ActorBehavior`] without a direct dependency
pub use async_trait::async_trait;
