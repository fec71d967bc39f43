//! Reliable-write (prepared write) transaction steps.

use super::{Operation, Progress, status_result};
use crate::link::{LinkEvent, LinkTransport};

#[derive(Debug, Default)]
pub struct BeginReliableWrite;

impl Operation for BeginReliableWrite {
    type Output = ();

    fn id(&self) -> String {
        "begin-reliable-write".into()
    }

    fn start(&mut self, link: &dyn LinkTransport) -> Progress<()> {
        Progress::Done(link.begin_reliable_write().map_err(Into::into))
    }

    fn on_event(&mut self, _event: &LinkEvent, _link: &dyn LinkTransport) -> Progress<()> {
        Progress::Pending
    }
}

/// Commit the queued writes. Completes on `ReliableWriteCompleted`.
#[derive(Debug, Default)]
pub struct ExecuteReliableWrite;

impl Operation for ExecuteReliableWrite {
    type Output = ();

    fn id(&self) -> String {
        "execute-reliable-write".into()
    }

    fn start(&mut self, link: &dyn LinkTransport) -> Progress<()> {
        Progress::issued(link.execute_reliable_write())
    }

    fn on_event(&mut self, event: &LinkEvent, _link: &dyn LinkTransport) -> Progress<()> {
        match event {
            LinkEvent::ReliableWriteCompleted { status } => Progress::Done(status_result(*status)),
            _ => Progress::Pending,
        }
    }
}

/// Discard the queued writes.
#[derive(Debug, Default)]
pub struct AbortReliableWrite;

impl Operation for AbortReliableWrite {
    type Output = ();

    fn id(&self) -> String {
        "abort-reliable-write".into()
    }

    fn start(&mut self, link: &dyn LinkTransport) -> Progress<()> {
        Progress::Done(link.abort_reliable_write().map_err(Into::into))
    }

    fn on_event(&mut self, _event: &LinkEvent, _link: &dyn LinkTransport) -> Progress<()> {
        Progress::Pending
    }
}
