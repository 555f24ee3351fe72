use std::collections::HashMap;

use derive_more::Display;

use crate::{
    common::{ClientId, Params, Value},
    storage::{Operation, StoreError, StoreResult},
};

/// The namespace an access targets.
#[derive(Debug, Clone, Copy, Display, PartialEq, Eq, Hash)]
pub enum Scope {
    #[display(fmt = "server")]
    Server,
    #[display(fmt = "client {}", _0)]
    Client(ClientId),
    #[display(fmt = "shared")]
    Shared,
}

/// The entity on whose behalf an access is made.
#[derive(Debug, Clone, Copy, Display, PartialEq, Eq, Hash)]
pub enum Accessor {
    #[display(fmt = "the server")]
    Server,
    #[display(fmt = "client {}", _0)]
    Client(ClientId),
}

#[derive(Debug, Default, Clone, PartialEq)]
/// A flat key-value namespace.
pub struct Namespace(HashMap<String, Value>);

impl Namespace {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Gets the keys of this namespace in sorted order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.0.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

fn lookup<'a>(ns: &'a Namespace, scope: Scope, key: &str) -> StoreResult<&'a Value> {
    ns.get(key).ok_or_else(|| StoreError::MissingKey {
        scope,
        key: key.to_string(),
    })
}

fn as_vector<'a>(value: &'a Value, scope: Scope, key: &str) -> StoreResult<&'a Params> {
    value
        .as_vector()
        .map_err(|source| StoreError::TypeMismatch {
            scope,
            key: key.to_string(),
            source,
        })
}

fn as_scalar(value: &Value, scope: Scope, key: &str) -> StoreResult<f64> {
    value.as_scalar().map_err(|source| StoreError::TypeMismatch {
        scope,
        key: key.to_string(),
        source,
    })
}

fn violation(
    accessor: Accessor,
    operation: Operation,
    scope: Scope,
    key: &str,
    reason: &'static str,
) -> StoreError {
    StoreError::AccessViolation {
        accessor,
        operation,
        scope,
        key: key.to_string(),
        reason,
    }
}

/// The namespaced state of a simulation.
///
/// # Ownership rules
///
/// | accessor    | server | own client | other client | shared                |
/// |-------------|--------|------------|--------------|-----------------------|
/// | `Server`    | rw     | rw         | rw           | r, w until sealed     |
/// | `Client(i)` | -      | rw         | -            | r                     |
///
/// Writes are visible to every subsequent read of the same scope.
#[derive(Debug, Clone)]
pub struct Store {
    server: Namespace,
    clients: Vec<Namespace>,
    shared: Namespace,
    sealed: bool,
}

impl Store {
    /// Creates an empty store with one namespace for each of the `num_clients` clients.
    pub fn new(num_clients: usize) -> Self {
        Self {
            server: Namespace::default(),
            clients: vec![Namespace::default(); num_clients],
            shared: Namespace::default(),
            sealed: false,
        }
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Seals the shared namespace. Every later write to it is an access violation.
    pub fn seal_shared(&mut self) {
        self.sealed = true;
    }

    fn check(
        &self,
        accessor: Accessor,
        operation: Operation,
        scope: Scope,
        key: &str,
    ) -> StoreResult<()> {
        for id in [accessor_client(accessor), scope_client(scope)]
            .iter()
            .flatten()
        {
            if *id >= self.clients.len() {
                return Err(StoreError::UnknownClient(*id));
            }
        }

        match (accessor, operation, scope) {
            (_, Operation::Write, Scope::Shared) if self.sealed => Err(violation(
                accessor,
                operation,
                scope,
                key,
                "the shared namespace is sealed",
            )),
            (Accessor::Server, _, _) => Ok(()),
            (Accessor::Client(_), Operation::Read, Scope::Shared) => Ok(()),
            (Accessor::Client(_), Operation::Write, Scope::Shared) => Err(violation(
                accessor,
                operation,
                scope,
                key,
                "clients never write the shared namespace",
            )),
            (Accessor::Client(a), _, Scope::Client(b)) if a == b => Ok(()),
            (Accessor::Client(_), _, Scope::Client(_)) => Err(violation(
                accessor,
                operation,
                scope,
                key,
                "client namespaces are private",
            )),
            (Accessor::Client(_), _, Scope::Server) => Err(violation(
                accessor,
                operation,
                scope,
                key,
                "the server namespace is private",
            )),
        }
    }

    fn namespace(&self, scope: Scope) -> &Namespace {
        match scope {
            Scope::Server => &self.server,
            Scope::Client(id) => &self.clients[id],
            Scope::Shared => &self.shared,
        }
    }

    fn namespace_mut(&mut self, scope: Scope) -> &mut Namespace {
        match scope {
            Scope::Server => &mut self.server,
            Scope::Client(id) => &mut self.clients[id],
            Scope::Shared => &mut self.shared,
        }
    }

    /// Reads `key` from `scope` on behalf of `accessor`.
    ///
    /// # Errors
    /// Fails with an access violation if `accessor` may not read `scope` and with
    /// [`StoreError::MissingKey`] if nothing was written under `key`.
    pub fn read(&self, accessor: Accessor, scope: Scope, key: &str) -> StoreResult<&Value> {
        self.check(accessor, Operation::Read, scope, key)?;
        lookup(self.namespace(scope), scope, key)
    }

    /// Writes `value` under `key` into `scope` on behalf of `accessor`, replacing any previous
    /// value.
    pub fn write(
        &mut self,
        accessor: Accessor,
        scope: Scope,
        key: &str,
        value: impl Into<Value>,
    ) -> StoreResult<()> {
        self.check(accessor, Operation::Write, scope, key)?;
        self.namespace_mut(scope).insert(key, value);
        Ok(())
    }

    pub fn read_vector(&self, accessor: Accessor, scope: Scope, key: &str) -> StoreResult<&Params> {
        as_vector(self.read(accessor, scope, key)?, scope, key)
    }

    pub fn read_scalar(&self, accessor: Accessor, scope: Scope, key: &str) -> StoreResult<f64> {
        as_scalar(self.read(accessor, scope, key)?, scope, key)
    }

    /// Hands out one view per requested client.
    ///
    /// The views borrow disjoint client namespaces together with the shared namespace, which
    /// lets the client tasks run concurrently. The views are returned in the order of `ids`.
    ///
    /// # Errors
    /// Fails if an id is unknown or requested twice.
    pub fn client_views(&mut self, ids: &[ClientId]) -> StoreResult<Vec<ClientView<'_>>> {
        if let Some(id) = ids.iter().find(|id| **id >= self.clients.len()) {
            return Err(StoreError::UnknownClient(*id));
        }

        let shared = &self.shared;
        let mut views: HashMap<ClientId, ClientView<'_>> = self
            .clients
            .iter_mut()
            .enumerate()
            .filter(|(id, _)| ids.contains(id))
            .map(|(id, own)| (id, ClientView { id, own, shared }))
            .collect();

        ids.iter()
            .map(|id| views.remove(id).ok_or(StoreError::DuplicateClient(*id)))
            .collect()
    }
}

fn accessor_client(accessor: Accessor) -> Option<ClientId> {
    match accessor {
        Accessor::Client(id) => Some(id),
        Accessor::Server => None,
    }
}

fn scope_client(scope: Scope) -> Option<ClientId> {
    match scope {
        Scope::Client(id) => Some(id),
        _ => None,
    }
}

/// The part of the [`Store`] a client task may see: its own namespace and the shared namespace.
#[derive(Debug)]
pub struct ClientView<'a> {
    id: ClientId,
    own: &'a mut Namespace,
    shared: &'a Namespace,
}

impl<'a> ClientView<'a> {
    pub fn client_id(&self) -> ClientId {
        self.id
    }

    pub fn accessor(&self) -> Accessor {
        Accessor::Client(self.id)
    }

    /// Reads `key` from `scope`, which must be the client's own scope or the shared one.
    pub fn read(&self, scope: Scope, key: &str) -> StoreResult<&Value> {
        match scope {
            Scope::Client(id) if id == self.id => lookup(&*self.own, scope, key),
            Scope::Shared => lookup(self.shared, scope, key),
            Scope::Client(_) => Err(violation(
                self.accessor(),
                Operation::Read,
                scope,
                key,
                "client namespaces are private",
            )),
            Scope::Server => Err(violation(
                self.accessor(),
                Operation::Read,
                scope,
                key,
                "the server namespace is private",
            )),
        }
    }

    /// Writes `value` under `key` into `scope`, which must be the client's own scope.
    pub fn write(&mut self, scope: Scope, key: &str, value: impl Into<Value>) -> StoreResult<()> {
        match scope {
            Scope::Client(id) if id == self.id => {
                self.own.insert(key, value);
                Ok(())
            }
            _ => Err(violation(
                self.accessor(),
                Operation::Write,
                scope,
                key,
                "clients may only write their own namespace",
            )),
        }
    }

    pub fn read_own_vector(&self, key: &str) -> StoreResult<&Params> {
        let scope = Scope::Client(self.id);
        as_vector(self.read(scope, key)?, scope, key)
    }

    pub fn write_own(&mut self, key: &str, value: impl Into<Value>) -> StoreResult<()> {
        self.write(Scope::Client(self.id), key, value)
    }

    pub fn read_shared_scalar(&self, key: &str) -> StoreResult<f64> {
        as_scalar(self.read(Scope::Shared, key)?, Scope::Shared, key)
    }
}
