use std::any::Any;
use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier of one invocation of one rule's trampoline.
pub type InvocationId = u64;

static NEXT_INVOCATION: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_invocation_id() -> InvocationId {
    NEXT_INVOCATION.fetch_add(1, Ordering::Relaxed)
}

/// Static description of an instrumented declaration, emitted once per
/// applied rule into the rewritten function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    /// Id of the hook rule that produced this site.
    pub rule: &'static str,
    /// Import path of the declaration, e.g. `pkg::client`.
    pub package: &'static str,
    /// Declaration name, `Type::method` for methods.
    pub function: &'static str,
}

/// A value snapshotted at function entry (or on return).
pub enum Captured {
    Text(String),
    Value(Box<dyn Any + Send>),
}

impl Debug for Captured {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Captured::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Captured::Value(_) => f.write_str("Value(..)"),
        }
    }
}

/// Per-invocation record threaded between a rule's onEnter and onExit hooks.
///
/// Owned by the trampoline guard that lives in the instrumented call frame;
/// never shared with other invocations.
#[derive(Debug)]
pub struct CallContext {
    site: &'static CallSite,
    id: InvocationId,
    parent: Option<InvocationId>,
    receiver: Option<&'static str>,
    params: Vec<(&'static str, Captured)>,
    return_value: Option<Captured>,
    attachments: Vec<Attachment>,
}

struct Attachment(Box<dyn Any + Send>);

impl Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Attachment(..)")
    }
}

impl CallContext {
    pub(crate) fn new(site: &'static CallSite, parent: Option<InvocationId>) -> Self {
        Self {
            site,
            id: next_invocation_id(),
            parent,
            receiver: None,
            params: Vec::new(),
            return_value: None,
            attachments: Vec::new(),
        }
    }

    pub fn site(&self) -> &'static CallSite {
        self.site
    }

    pub fn invocation_id(&self) -> InvocationId {
        self.id
    }

    /// Invocation id of the enclosing instrumented call, if any.
    pub fn parent_id(&self) -> Option<InvocationId> {
        self.parent
    }

    /// Type name of the method receiver, `None` for free functions.
    pub fn receiver_type(&self) -> Option<&'static str> {
        self.receiver
    }

    pub fn capture_receiver<R: ?Sized>(&mut self, _receiver: &R) {
        self.receiver = Some(std::any::type_name::<R>());
    }

    pub fn capture_debug<T: Debug + ?Sized>(&mut self, name: &'static str, value: &T) {
        self.store(name, Captured::Text(format!("{:?}", value)));
    }

    pub fn capture_display<T: Display + ?Sized>(&mut self, name: &'static str, value: &T) {
        self.store(name, Captured::Text(value.to_string()));
    }

    pub fn capture_clone<T: Clone + Send + 'static>(&mut self, name: &'static str, value: &T) {
        self.store(name, Captured::Value(Box::new(value.clone())));
    }

    fn store(&mut self, name: &'static str, captured: Captured) {
        if name == "return" {
            self.return_value = Some(captured);
        } else {
            self.params.push((name, captured));
        }
    }

    /// Text form of a `debug`/`display` capture.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.iter().find(|(n, _)| *n == name).and_then(|(_, c)| match c {
            Captured::Text(text) => Some(text.as_str()),
            Captured::Value(_) => None,
        })
    }

    /// Typed form of a `clone` capture.
    pub fn param_value<T: 'static>(&self, name: &str) -> Option<&T> {
        self.params.iter().find(|(n, _)| *n == name).and_then(|(_, c)| match c {
            Captured::Value(value) => value.downcast_ref::<T>(),
            Captured::Text(_) => None,
        })
    }

    pub fn params(&self) -> impl Iterator<Item = (&'static str, &Captured)> {
        self.params.iter().map(|(n, c)| (*n, c))
    }

    pub fn return_value(&self) -> Option<&str> {
        match &self.return_value {
            Some(Captured::Text(text)) => Some(text.as_str()),
            _ => None,
        }
    }

    /// Merge a hook's return value into the context. Unit is ignored.
    pub fn attach<T: Send + 'static>(&mut self, value: T) {
        if std::any::TypeId::of::<T>() == std::any::TypeId::of::<()>() {
            return;
        }
        self.attachments.push(Attachment(Box::new(value)));
    }

    pub fn attachment<T: 'static>(&self) -> Option<&T> {
        self.attachments.iter().find_map(|a| a.0.downcast_ref::<T>())
    }

    pub fn take_attachment<T: 'static>(&mut self) -> Option<T> {
        let pos = self.attachments.iter().position(|a| a.0.is::<T>())?;
        let Attachment(boxed) = self.attachments.remove(pos);
        boxed.downcast::<T>().ok().map(|b| *b)
    }
}
