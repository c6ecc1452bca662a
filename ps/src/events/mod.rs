//! Event Bus built on the shared store
//!
//! Processes exchange work by firing named events. An event is a queue stored under its
//! name; firing appends, listening drains.
//!
//! # Architecture
//!
//! ```text
//!   process A                   shared store                  process B
//! ┌────────────┐  GET + SET  ┌──────────────────┐  GET batch  ┌─────────────┐
//! │ fire_event ├────────────►│ "jobs": [v1, v2] │◄────────────┤ poll loop   │
//! └────────────┘             └──────────────────┘   DELETE    │  callback() │
//!                                                             └─────────────┘
//! ```
//!
//! Within one event name delivery order equals fire order. Nothing is ordered across names.
//!
//! # Usage
//!
//! ```rust,ignore
//! use procshare::events::{EventBus, ListenMode, handler};
//!
//! let bus = EventBus::new(client);
//! bus.add_event_listener("jobs", handler(|job| async move {
//!     println!("got {}", job);
//!     Ok(())
//! }))?;
//! bus.start_listening(ListenMode::Background).await;
//! bus.fire_event("jobs", serde_json::json!({"id": 1})).await?;
//! ```

mod bus;
mod callback;

pub use bus::{EventBus, ListenMode, METHOD_EVENT_PREFIX, Once, WeakEventBus, method_event};
pub use callback::{EventHandler, MethodHandler, handler, method_handler};
