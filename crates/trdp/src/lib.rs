//! Train Real-time Data Protocol (TRDP) stack for train Ethernet
//! backbones.
//!
//! This crate implements the IEC 61375-family communication stack used
//! for deterministic in-consist and train-wide data exchange: periodic
//! **process data** (publish/subscribe telegrams with deadline
//! supervision) and transactional **message data**
//! (request/reply/confirm with session identity, timeouts and retries)
//! over UDP and TCP, plus the schema-driven marshaller that converts
//! between host-layout datasets and the packed big-endian wire layout.
//!
//! The stack is select/poll driven and never owns a thread: the
//! application asks the session for the next wake-up interval and the
//! descriptors of interest, waits, then hands control back to
//! [`Session::process`].
//!
//! # Publishing process data
//!
//! ```ignore
//! use trdp::{MemConfig, PublishSpec, Registry, SessionConfig, TimeVal};
//!
//! let registry = Registry::new(MemConfig::default())?;
//! let session = registry.open_session(
//!     SessionConfig {
//!         own_ip: "10.0.0.10".parse()?,
//!         ..SessionConfig::default()
//!     },
//!     None,
//! )?;
//!
//! let handle = session.publish(&PublishSpec {
//!     com_id: 1001,
//!     dest_ip: "10.0.0.20".parse()?,
//!     interval: TimeVal::from_millis(100),
//!     data: b"Hello TRDP".to_vec(),
//!     ..PublishSpec::default()
//! })?;
//!
//! loop {
//!     let ready = session.wait_for_event(None)?;
//!     session.process(Some(&ready))?;
//!     // session.put(handle, &new_data)?;
//! }
//! ```
//!
//! # Subscribing with timeout supervision
//!
//! ```ignore
//! use std::sync::Arc;
//! use trdp::{ResultCode, SubscribeSpec, TimeVal};
//!
//! let sub = session.subscribe(&SubscribeSpec {
//!     com_id: 1001,
//!     dest_ip: "10.0.0.10".parse()?,
//!     timeout: TimeVal::from_millis(300),
//!     max_size: 64,
//!     callback: Some(Arc::new(|event| {
//!         match event.info.result {
//!             ResultCode::Ok => println!("data: {:?}", event.payload),
//!             ResultCode::Timeout => println!("source went quiet"),
//!             _ => {}
//!         }
//!     })),
//!     ..SubscribeSpec::default()
//! })?;
//! ```
//!
//! # Request / reply
//!
//! ```ignore
//! use trdp::{ListenSpec, RequestSpec, TimeVal};
//!
//! // Replier side.
//! replier.add_listener(&ListenSpec {
//!     com_id: 2001,
//!     callback: Some(Arc::new(move |event| {
//!         // answer from the application's context
//!     })),
//!     ..ListenSpec::default()
//! })?;
//!
//! // Caller side: two repliers expected, one retry.
//! let session_id = caller.request(&RequestSpec {
//!     com_id: 2001,
//!     dest_ip: "10.0.0.20".parse()?,
//!     reply_timeout: TimeVal::from_millis(300),
//!     num_repliers: 2,
//!     num_retries_max: Some(1),
//!     data: b"read sensors".to_vec(),
//!     ..RequestSpec::default()
//! })?;
//! ```

pub mod config;
pub mod error;
pub mod fcs;
pub mod marshall;
pub mod md;
pub mod mem;
pub mod pd;
pub mod session;
pub mod sock;
pub mod stats;
pub mod time;
pub mod timers;
pub mod wire;

// Re-export the session surface at the crate root for convenience.
pub use config::{
    MdConfig, PdConfig, PktFlags, ProcessConfig, SendParam, SessionConfig, TimeoutBehavior,
};
pub use error::{Result, ResultCode, TrdpError};
pub use marshall::{Dataset, Element, ElemType, HostLayout, LeafType, Marshalling};
pub use md::{ListenHandle, ListenSpec, MdCallback, MdEvent, MdInfo, RequestSpec, SessionId};
pub use mem::MemConfig;
pub use pd::{
    PdCallback, PdEvent, PdInfo, PubHandle, PublishSpec, SubHandle, SubscribeSpec,
};
pub use session::{Registry, Session};
pub use stats::{MdStats, PdStats, SessionStats};
pub use time::TimeVal;
pub use wire::{MsgType, MD_PORT, PD_UDP_PORT};
