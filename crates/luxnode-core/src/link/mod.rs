//! Link transport layer module.

pub mod btle;
pub mod constants;
pub mod mock;
pub mod observable;
pub mod traits;

pub use btle::{BtleLink, BtleLinkFactory};
pub use mock::{ConnectBehavior, MockLink, MockLinkFactory, MockNode, MockRequest, WriteEffect};
pub use observable::ObservableLink;
pub use traits::{EventSink, LinkEvent, LinkFactory, LinkTransport, TransportError};
