#[cfg(feature = "native")]
pub mod connection;
pub mod error;
pub mod ns;
pub mod outbound;
pub mod payload;
pub mod pending;
pub mod router;
pub mod sasl;
pub mod stanza;
pub mod transport;

#[cfg(feature = "native")]
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{ConnectionError, OutboundError, RouterError, StanzaError};
pub use pending::{NotFound, PendingRequestTable, RequestId, RequestKind};
pub use router::{
    DispatchOutcome, Disposition, HandlerError, HandlerSlot, StanzaRouter, StanzaType,
};
pub use sasl::SelectedMechanism;
pub use stanza::{ErrorDetails, Stanza, StanzaKind};
pub use transport::{ConnectionConfig, XmppTransport};
