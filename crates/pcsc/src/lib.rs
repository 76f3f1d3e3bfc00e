//! Reader lifecycle tracking and single-flight card sessions over PC/SC
//!
//! This crate turns the asynchronous, bit-encoded status reports of a smart
//! card driver into a card session lifecycle per reader, and guarantees that
//! at most one operation is ever in flight against a given card.
//!
//! # Features
//!
//! - `pcsc`: [`PcscDriver`], a driver backed by the system PC/SC service
//!
//! # Examples
//!
//! ```no_run
//! # #[cfg(feature = "pcsc")]
//! # async fn example() -> Result<(), nexum_pcsc::Error> {
//! use nexum_pcsc::{Client, PcscDriver};
//!
//! let client = Client::new(PcscDriver::establish()?);
//! client.events().reader.on(|reader| {
//!     let name = reader.name().to_string();
//!     reader.events().change.on(move |change| {
//!         println!("{name}: {} atr={}", change.status, hex::encode(&change.atr));
//!     });
//! });
//!
//! client.start()?;
//! let pump = client.clone();
//! tokio::spawn(async move { pump.run().await });
//!
//! if let Some(reader) = client.readers().first() {
//!     let response = reader
//!         .with_card(async |card| {
//!             let select = [0x00, 0xA4, 0x04, 0x00, 0x00];
//!             Ok(card.transmit(&select, None).await?.into_owned())
//!         })
//!         .await?;
//!     println!("response: {}", hex::encode(response));
//! }
//!
//! client.stop().await;
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core modules
mod card;
mod client;
mod config;
pub mod driver;
mod error;
pub mod event;
pub mod flags;
mod reader;

#[cfg(feature = "pcsc")]
mod backend;

// Public exports
pub use card::{Card, CardState, Transaction};
pub use client::{Client, ClientEvents};
pub use config::{ClientConfig, ReplugPolicy};
pub use driver::{Disposition, Protocol, ShareMode};
pub use error::{DriverError, Error, ErrorCode, ErrorKind, ParseStatusError};
pub use event::{EventEmitter, ListenerId, ReaderChange};
pub use flags::{CardStatus, CardStatusFlags, ReaderStatus, ReaderStatusFlags, StatusFlags};
pub use reader::{Reader, ReaderEvents, ReaderState};

#[cfg(feature = "pcsc")]
pub use backend::PcscDriver;
