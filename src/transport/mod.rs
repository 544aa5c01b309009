//! Connection plumbing shared by the relay and the client controller.
//!
//! A connection is split into a [`FrameSink`] for writes and a
//! [`FrameSource`] stream of [`LegEvent`]s for reads, so each session can
//! consume every leg through one typed event enumeration.

pub mod rest;
pub mod ws;

use crate::Result;
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything a leg can report, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegEvent {
    /// One text message, exactly as received.
    Frame(String),
    /// The peer closed the connection.
    Closed,
    /// Transport-level failure; the leg is unusable.
    Failed(String),
}

/// Read half of a leg. Stream exhaustion is equivalent to [`LegEvent::Closed`].
pub type FrameSource = BoxStream<'static, LegEvent>;

/// Write half of a leg.
pub trait FrameSink: Send {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<()>>;
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

pub struct Leg {
    pub sink: Box<dyn FrameSink>,
    pub source: FrameSource,
}

/// Opens one leg on demand. Dropping the returned future abandons the
/// handshake.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'static, Result<Leg>>;
}
