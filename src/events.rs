//! Event notification for streams
//!
//! Node.js compatible emitter semantics, typed for the stream events:
//! - Listeners run synchronously in subscription order
//! - `once` listeners are removed before they run
//! - `prepend` puts a listener in front of existing ones
//! - An emit dispatches to a snapshot, so listeners added or removed while
//!   emitting take effect from the next emit

use crate::{chunk::Chunk, error::StreamError, stream::Stream};
use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

/// Names of the events a stream emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    Readable,
    End,
    Finish,
    Prefinish,
    Drain,
    Error,
    Close,
    Pause,
    Resume,
    Pipe,
    Unpipe,
}

/// An emitted event with its payload
#[derive(Clone)]
pub enum Event {
    Data(Chunk),
    Readable,
    End,
    Finish,
    Prefinish,
    Drain,
    Error(StreamError),
    Close,
    Pause,
    Resume,
    /// Emitted on a destination; carries the source
    Pipe(Stream),
    /// Emitted on a destination; carries the source
    Unpipe(Stream),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Data(_) => EventKind::Data,
            Event::Readable => EventKind::Readable,
            Event::End => EventKind::End,
            Event::Finish => EventKind::Finish,
            Event::Prefinish => EventKind::Prefinish,
            Event::Drain => EventKind::Drain,
            Event::Error(_) => EventKind::Error,
            Event::Close => EventKind::Close,
            Event::Pause => EventKind::Pause,
            Event::Resume => EventKind::Resume,
            Event::Pipe(_) => EventKind::Pipe,
            Event::Unpipe(_) => EventKind::Unpipe,
        }
    }

    pub fn as_data(&self) -> Option<&Chunk> {
        match self {
            Event::Data(chunk) => Some(chunk),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&StreamError> {
        match self {
            Event::Error(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Data(chunk) => f.debug_tuple("Data").field(chunk).finish(),
            Event::Error(err) => f.debug_tuple("Error").field(err).finish(),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

/// Identifies a registered listener for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub(crate) type Listener = Rc<dyn Fn(&Event)>;

struct Entry {
    id: ListenerId,
    kind: EventKind,
    once: bool,
    listener: Listener,
}

/// Subscription list shared by every role of a stream
#[derive(Default)]
pub struct EventEmitter {
    next_id: Cell<u64>,
    listeners: RefCell<Vec<Entry>>,
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listeners.borrow().len())
            .finish()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, kind: EventKind, once: bool, front: bool, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        let entry = Entry {
            id,
            kind,
            once,
            listener,
        };
        let mut listeners = self.listeners.borrow_mut();
        if front {
            listeners.insert(0, entry);
        } else {
            listeners.push(entry);
        }
        id
    }

    pub fn on(&self, kind: EventKind, listener: impl Fn(&Event) + 'static) -> ListenerId {
        self.insert(kind, false, false, Rc::new(listener))
    }

    pub fn once(&self, kind: EventKind, listener: impl Fn(&Event) + 'static) -> ListenerId {
        self.insert(kind, true, false, Rc::new(listener))
    }

    pub fn prepend(&self, kind: EventKind, listener: impl Fn(&Event) + 'static) -> ListenerId {
        self.insert(kind, false, true, Rc::new(listener))
    }

    /// Remove a listener. Returns the kind it was registered for.
    pub fn off(&self, id: ListenerId) -> Option<EventKind> {
        let mut listeners = self.listeners.borrow_mut();
        let index = listeners.iter().position(|e| e.id == id)?;
        Some(listeners.remove(index).kind)
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.borrow().iter().filter(|e| e.kind == kind).count()
    }

    pub fn has_listener(&self, id: ListenerId) -> bool {
        self.listeners.borrow().iter().any(|e| e.id == id)
    }

    /// Dispatch `event` to its listeners. Returns false if there were none.
    pub fn emit(&self, event: &Event) -> bool {
        let kind = event.kind();
        let snapshot: Vec<Listener> = {
            let mut listeners = self.listeners.borrow_mut();
            let snapshot = listeners
                .iter()
                .filter(|e| e.kind == kind)
                .map(|e| e.listener.clone())
                .collect();
            listeners.retain(|e| !(e.kind == kind && e.once));
            snapshot
        };
        for listener in &snapshot {
            listener(event);
        }
        !snapshot.is_empty()
    }
}
