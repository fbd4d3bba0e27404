//! The event carried along a chain.
//!
//! A [`Context`] is a linear value: it is moved from tunnel to tunnel and is
//! destroyed by whichever tunnel stops forwarding it. Dropping a payload
//! context returns its buffer to the worker pool.

use std::fmt;

use crate::buffer::Buffer;
use crate::io::IoHandle;
use crate::line::Line;

/// What a context signals. Lifecycle transitions carry no payload and payload
/// contexts carry no lifecycle transition.
pub enum Kind {
    /// A connection was opened below; tunnels above may set up state.
    Init,
    /// The chain above accepted the connection.
    Established,
    /// The connection is closing in the direction of travel.
    Fin,
    /// Connection bytes.
    Payload(Buffer),
}

impl Kind {
    fn name(&self) -> &'static str {
        match self {
            Kind::Init => "init",
            Kind::Established => "est",
            Kind::Fin => "fin",
            Kind::Payload(_) => "payload",
        }
    }
}

pub struct Context {
    line: Line,
    kind: Kind,
    first: bool,
    src_io: Option<IoHandle>,
}

impl Context {
    fn new(line: &Line, kind: Kind) -> Self {
        Self {
            line: line.clone(),
            kind,
            first: false,
            src_io: None,
        }
    }

    pub fn init(line: &Line) -> Self {
        Self::new(line, Kind::Init)
    }

    pub fn established(line: &Line) -> Self {
        Self::new(line, Kind::Established)
    }

    pub fn fin(line: &Line) -> Self {
        Self::new(line, Kind::Fin)
    }

    pub fn payload(line: &Line, buf: Buffer) -> Self {
        Self::new(line, Kind::Payload(buf))
    }

    /// Attach the transport whose reads produced this context.
    pub fn with_src_io(mut self, io: Option<IoHandle>) -> Self {
        self.src_io = io;
        self
    }

    /// Mark this as the first payload of its connection in this direction.
    pub fn with_first(mut self, first: bool) -> Self {
        self.first = first;
        self
    }

    pub fn line(&self) -> &Line {
        &self.line
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn is_init(&self) -> bool {
        matches!(self.kind, Kind::Init)
    }

    pub fn is_established(&self) -> bool {
        matches!(self.kind, Kind::Established)
    }

    pub fn is_fin(&self) -> bool {
        matches!(self.kind, Kind::Fin)
    }

    pub fn is_first(&self) -> bool {
        self.first
    }

    pub fn src_io(&self) -> Option<&IoHandle> {
        self.src_io.as_ref()
    }

    pub fn payload_ref(&self) -> Option<&Buffer> {
        match &self.kind {
            Kind::Payload(buf) => Some(buf),
            _ => None,
        }
    }

    pub fn payload_mut(&mut self) -> Option<&mut Buffer> {
        match &mut self.kind {
            Kind::Payload(buf) => Some(buf),
            _ => None,
        }
    }

    /// Payload length, 0 for lifecycle contexts.
    pub fn payload_len(&self) -> usize {
        self.payload_ref().map_or(0, |buf| buf.len())
    }

    /// Destroy the context and keep its payload, if any.
    pub fn into_payload(self) -> Option<Buffer> {
        match self.kind {
            Kind::Payload(buf) => Some(buf),
            _ => None,
        }
    }

    /// Destroy the context, returning its line, payload and origin.
    pub fn into_parts(self) -> (Line, Option<Buffer>, Option<IoHandle>) {
        let payload = match self.kind {
            Kind::Payload(buf) => Some(buf),
            _ => None,
        };
        (self.line, payload, self.src_io)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("line", &self.line.id())
            .field("kind", &self.kind.name())
            .field("len", &self.payload_len())
            .field("first", &self.first)
            .finish()
    }
}
