#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

//! # tiflis-client
//!
//! Client-side half of the tiflis session backbone: the connection state
//! machine, the retrying/queueing command sender, the streaming-message
//! reconciler, audio mediation, sync bootstrap, and the watch relay.
//!
//! The crate is a library — mobile, watch, and web shells embed it and
//! drive their UI from the change-notifying values it exposes. All
//! component state is owned by [`root::ClientRoot`]; nothing here is a
//! process-wide singleton.

pub mod audio;
pub mod config;
pub mod connection;
pub mod observable;
pub mod reconciler;
pub mod relay;
pub mod root;
pub mod sender;
pub mod store;
pub mod sync;

pub use config::ClientConfig;
pub use connection::{Connection, ConnectionState};
pub use observable::Observable;
pub use root::ClientRoot;
pub use sender::{CommandConfig, CommandSender, SendOutcome};
