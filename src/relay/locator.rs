//! Heuristic discovery of the host's chat state in a shared global scope.
//!
//! Hosts that cannot call [`SinkRegistry::register`](super::SinkRegistry::register)
//! publish their state object somewhere in a [`GlobalScope`] instead.
//! [`ScopeLocator`] sniffs it out by conventional names and by shape.
//! Nothing is cached: the host may recreate its state at any moment.

use std::sync::{Arc, RwLock};

use tracing::debug;

use super::{SinkMethod, SinkResolver, StateSink};

/// Well-known roots, in priority order.
const ROOTS: &[&str] = &["app_state", "state"];

/// Conventional child name under a root.
const CHILD: &str = "chat_state";

/// Case-insensitive marker for chat state keys.
const MARKER: &str = "chatstate";

/// A value bound to a name in a scope.
#[derive(Clone)]
pub enum ScopeValue {
    Sink(Arc<dyn StateSink>),
    Namespace(Scope),
    /// Anything else living in the scope.
    Opaque,
}

/// Insertion-ordered name bindings.
#[derive(Clone, Default)]
pub struct Scope {
    entries: Vec<(String, ScopeValue)>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, value: ScopeValue) -> Self {
        self.insert(name, value);
        self
    }

    /// Bind a name, replacing an existing binding in place.
    pub fn insert(&mut self, name: impl Into<String>, value: ScopeValue) {
        let name = name.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<ScopeValue> {
        let idx = self.entries.iter().position(|(key, _)| key == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn get(&self, name: &str) -> Option<&ScopeValue> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScopeValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    fn namespace(&self, name: &str) -> Option<&Scope> {
        match self.get(name) {
            Some(ScopeValue::Namespace(scope)) => Some(scope),
            _ => None,
        }
    }
}

/// The shared global scope the host and the bridge both see.
#[derive(Default)]
pub struct GlobalScope {
    root: RwLock<Scope>,
}

impl GlobalScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, value: ScopeValue) {
        self.root.write().unwrap().insert(name, value);
    }

    pub fn remove(&self, name: &str) -> Option<ScopeValue> {
        self.root.write().unwrap().remove(name)
    }

    /// Run `f` against a namespace, creating it if absent.
    pub fn with_namespace<R>(&self, name: &str, f: impl FnOnce(&mut Scope) -> R) -> R {
        let mut root = self.root.write().unwrap();
        if !matches!(root.get(name), Some(ScopeValue::Namespace(_))) {
            root.insert(name, ScopeValue::Namespace(Scope::new()));
        }
        let scope = root
            .entries
            .iter_mut()
            .find_map(|(key, value)| match value {
                ScopeValue::Namespace(scope) if key == name => Some(scope),
                _ => None,
            });
        match scope {
            Some(scope) => f(scope),
            None => unreachable!("namespace inserted above"),
        }
    }
}

/// Looks up the chat state in a [`GlobalScope`] on every call.
pub struct ScopeLocator {
    scope: Arc<GlobalScope>,
}

impl ScopeLocator {
    pub fn new(scope: Arc<GlobalScope>) -> Self {
        Self { scope }
    }

    /// Find the chat state. Absence is normal while the host boots.
    pub fn locate(&self) -> Option<Arc<dyn StateSink>> {
        let root = self.scope.root.read().unwrap();
        locate_in(&root)
    }
}

impl SinkResolver for ScopeLocator {
    fn resolve(&self) -> Option<Arc<dyn StateSink>> {
        self.locate()
    }
}

fn locate_in(global: &Scope) -> Option<Arc<dyn StateSink>> {
    for name in ROOTS {
        if let Some(root) = global.namespace(name)
            && let Some(ScopeValue::Sink(sink)) = root.get(CHILD)
        {
            return Some(Arc::clone(sink));
        }
    }

    if let Some(root) = ROOTS.iter().find_map(|name| global.namespace(name)) {
        for (key, value) in root.iter() {
            if let ScopeValue::Sink(sink) = value
                && key.to_lowercase().contains(MARKER)
            {
                debug!(key, "found chat state under root");
                return Some(Arc::clone(sink));
            }
        }
    }

    // Names alone are unreliable at the top level, so require the shape too.
    for (key, value) in global.iter() {
        if let ScopeValue::Sink(sink) = value
            && key.to_lowercase().contains(MARKER)
            && SinkMethod::ALL.iter().any(|method| sink.exposes(*method))
        {
            debug!(key, "found chat state in global scope");
            return Some(Arc::clone(sink));
        }
    }

    None
}
