#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_docs_in_private_items)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

//! # Bank Bus
//!
//! The neural bus: a connection-oriented, stream-multiplexed,
//! authenticated transport carrying pattern sync, live reasoning streams,
//! and store snapshots between reasoning-bank instances.
//!
//! Every action a peer takes is bounded by a signed intent capability:
//! scopes name what the peer may do, a validity window names when, and a
//! spend cap bounds how many high-cost actions (pattern writes, snapshot
//! requests) the capability authorizes in total.
//!
//! ## Architecture
//!
//! - [`codec`]: length-delimited typed frames, multiplexed by stream id
//! - [`session`]: actor-per-session state machines with credit-based
//!   backpressure and keep-alive
//! - [`node`]: the listener/dialer endpoint owning the session registry
//! - gossip: periodic pattern-summary exchange between connected peers
//! - snapshot: bulk store transfer for joining peers
//!
//! ## Example
//!
//! ```no_run
//! use bank_bus::BusNode;
//! use bank_core::config::BankConfig;
//! use bank_core::storage::MemoryPatternStore;
//! use bank_core::similarity::SimilarityMetric;
//! use bank_core::Keyring;
//! use ed25519_dalek::SigningKey;
//! use std::sync::Arc;
//!
//! # async fn example() -> bank_bus::Result<()> {
//! let store = Arc::new(MemoryPatternStore::new(SimilarityMetric::Cosine));
//! let signing = SigningKey::from_bytes(&[1u8; 32]);
//! let node = BusNode::new(store, signing, Keyring::new(), BankConfig::default());
//! let addr = node.listen("127.0.0.1:0").await?;
//! println!("listening on {addr}");
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
mod gossip;
pub mod node;
pub mod reasoning;
mod replay;
pub mod session;
mod snapshot;
mod sync;

pub use codec::{Frame, MuxCodec, MuxItem};
pub use error::{BusError, Result};
pub use node::BusNode;
pub use reasoning::ReasoningEvent;
pub use session::{SessionHandle, SessionInfo, SessionState, StreamSender};
