use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

/// A short user-facing message, the native stand-in for a toast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub description: String,
    pub severity: Severity,
}

impl Notice {
    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self { title: title.into(), description: description.into(), severity: Severity::Info }
    }

    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self { title: title.into(), description: description.into(), severity: Severity::Error }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    Notice(Notice),
    TranscriptDelta {
        item_id: Option<String>,
        delta: String,
    },
}

pub struct ControllerEventStream<'a> {
    rx: &'a mut mpsc::Receiver<ControllerEvent>,
}

impl<'a> ControllerEventStream<'a> {
    #[must_use]
    pub const fn new(rx: &'a mut mpsc::Receiver<ControllerEvent>) -> Self {
        Self { rx }
    }
}

impl Stream for ControllerEventStream<'_> {
    type Item = ControllerEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll_recv(cx)
    }
}
