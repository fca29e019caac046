//! # softphone-core
//!
//! Call-session and presence engine for a contact-centre softphone. It sits
//! between an agent UI and a SIP signaling stack and owns:
//!
//! - transport connectivity and registration, with capped exponential
//!   reconnection
//! - a registry of call sessions, each driven through a call state machine
//! - three agent lines with a selected (foreground) line and a FIFO queue
//!   for calls that arrive while every line is occupied
//! - DTMF sequences paced per session
//! - blind and attended (consultative) transfers
//! - busy-lamp-field (BLF) subscriptions for monitored extensions
//! - a typed event bus the UI subscribes to
//!
//! Signaling itself is injected through the [`SignalingTransport`] trait; the
//! transport reports what the network did as [`TransportEvent`]s.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use softphone_core::{EngineBuilder, EventFilter, SignalingTransport, SoftphoneResult};
//! use softphone_core::registration::{RegistrationConfig, ServerConfig};
//!
//! async fn run(transport: Arc<dyn SignalingTransport>) -> SoftphoneResult<()> {
//!     let engine = EngineBuilder::new(transport)
//!         .server(ServerConfig::new("sip:pbx.example.com", "example.com"))
//!         .registration(RegistrationConfig::new("sip:1000@example.com"))
//!         .build()?;
//!     let mut events = engine.subscribe_events(EventFilter::all());
//!
//!     engine.connect().await?;
//!     engine.register().await?;
//!     let call = engine.make_call("2001", None).await?;
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     engine.hangup_call(call).await
//! }
//! ```

pub mod call;
pub mod client;
pub mod dtmf;
pub mod error;
pub mod events;
pub mod lines;
pub mod logging;
pub mod presence;
pub mod registration;
pub mod registry;
pub mod transfer;
pub mod transport;

pub use call::{CallDirection, CallHandle, CallOutcome, CallRecord, CallSession, CallState, SessionId};
pub use client::{
    BlfBatchReport, CallConfig, EngineBuilder, EngineConfig, EngineStats, ReconnectPolicy, SoftphoneEngine,
};
pub use dtmf::DtmfConfig;
pub use error::{SoftphoneError, SoftphoneResult};
pub use events::{EngineEvent, EventBus, EventFilter, EventPriority, EventSubscription, SubscriptionKey};
pub use lines::{Line, LineNumber, LineState, LINE_COUNT};
pub use logging::{setup_logging, LoggingConfig};
pub use presence::{BlfState, PresenceConfig};
pub use registration::{RegistrationConfig, RegistrationState, ServerConfig, TransportState};
pub use transfer::{TransferId, TransferMode, TransferOperation, TransferPhase};
pub use transport::{
    DialogState, IncomingInvite, SignalingError, SignalingTransport, SubscriptionHandle, TransportEvent,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
