//! Fluux BOSH: XMPP over long-polled HTTP (XEP-0124 / XEP-0206).
//!
//! The [`bosh`] module holds the session engine. A caller builds a
//! [`BoshConfig`], hands a [`SessionListener`] to [`Session::new`] and
//! exchanges raw XML elements:
//!
//! ```no_run
//! use std::sync::Arc;
//! use fluux_bosh::{BoshConfig, Delivery, Session, SessionListener};
//!
//! struct Printer;
//!
//! impl SessionListener for Printer {
//!     fn deliver(&self, element: &str) -> Delivery {
//!         println!("{element}");
//!         Delivery::Continue
//!     }
//! }
//!
//! # async fn run() -> Result<(), fluux_bosh::BoshError> {
//! let session = Session::new(BoshConfig::for_domain("example.com"), Arc::new(Printer))?;
//! session.connect().await?;
//! session.send(vec!["<presence/>".to_string()])?;
//! session.close().await;
//! # Ok(())
//! # }
//! ```

pub mod bosh;

pub use bosh::body::Body;
pub use bosh::compression::ContentCodec;
pub use bosh::condition::Condition;
pub use bosh::config::BoshConfig;
pub use bosh::dns::BoshEndpoint;
pub use bosh::error::{BoshError, CodecError, ConfigError, TransportError};
pub use bosh::state::Phase;
pub use bosh::{Delivery, Session, SessionListener};
