//! Name-keyed table of callable methods.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use serde_json::Value;

use crate::error::{RemoteError, RemoteErrorKind};
use crate::packet::Manifest;

/// A callable method: positional JSON arguments in, JSON value or error out.
pub type Method = Rc<dyn Fn(&[Value]) -> std::result::Result<Value, RemoteError>>;

/// Wrap a closure as a [`Method`].
pub fn method<F>(f: F) -> Method
where
    F: Fn(&[Value]) -> std::result::Result<Value, RemoteError> + 'static,
{
    Rc::new(f)
}

/// Methods offered to the other side of a connection.
///
/// Registration order is preserved for [`names`](Self::names); registering an
/// existing name replaces its callable in place. A name may be registered
/// without a callable, in which case invoking it fails with
/// [`RemoteErrorKind::NotCallable`].
#[derive(Clone, Default)]
pub struct MethodRegistry {
    order: Vec<String>,
    methods: HashMap<String, Option<Method>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callable` under `name`. Returns `true` if the name was new.
    pub fn register(&mut self, name: impl Into<String>, callable: Method) -> bool {
        self.insert(name.into(), Some(callable))
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> bool
    where
        F: Fn(&[Value]) -> std::result::Result<Value, RemoteError> + 'static,
    {
        self.register(name, method(f))
    }

    /// Register a name with nothing callable behind it.
    pub fn register_name(&mut self, name: impl Into<String>) -> bool {
        self.insert(name.into(), None)
    }

    /// Register every method produced by `source`; returns the registered
    /// names in source order.
    pub fn register_all(&mut self, source: impl MethodSource) -> Vec<String> {
        source
            .into_methods()
            .into_iter()
            .map(|(name, callable)| {
                self.insert(name.clone(), Some(callable));
                name
            })
            .collect()
    }

    fn insert(&mut self, name: String, callable: Option<Method>) -> bool {
        let is_new = !self.methods.contains_key(&name);
        if is_new {
            self.order.push(name.clone());
        }
        self.methods.insert(name, callable);
        is_new
    }

    pub fn has(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The callable registered under `name`.
    pub fn lookup(&self, name: &str) -> std::result::Result<Method, RemoteError> {
        match self.methods.get(name) {
            None => Err(RemoteError::new(
                RemoteErrorKind::UnknownMethod,
                format!("method `{name}` does not exist"),
            )),
            Some(None) => Err(RemoteError::new(
                RemoteErrorKind::NotCallable,
                format!("method `{name}` is registered but not callable"),
            )),
            Some(Some(callable)) => Ok(Rc::clone(callable)),
        }
    }

    pub fn invoke(&self, name: &str, args: &[Value]) -> std::result::Result<Value, RemoteError> {
        let callable = self.lookup(name)?;
        callable(args)
    }

    /// The name-only view sent to the other side.
    pub fn manifest(&self) -> Manifest {
        Manifest {
            methods: self.names(),
        }
    }

    /// Callable entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Method)> {
        self.order.iter().filter_map(|name| match self.methods.get(name) {
            Some(Some(callable)) => Some((name.as_str(), callable)),
            _ => None,
        })
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.order)
            .finish()
    }
}

/// Anything that can be turned into a list of named methods.
///
/// This is how a whole service object is registered at once: implement
/// `MethodSource` for it (or collect its methods into one of the provided
/// collection types) and pass it to [`MethodRegistry::register_all`].
pub trait MethodSource {
    fn into_methods(self) -> Vec<(String, Method)>;
}

impl MethodSource for Vec<(String, Method)> {
    fn into_methods(self) -> Vec<(String, Method)> {
        self
    }
}

impl MethodSource for HashMap<String, Method> {
    fn into_methods(self) -> Vec<(String, Method)> {
        let mut methods: Vec<_> = self.into_iter().collect();
        methods.sort_by(|a, b| a.0.cmp(&b.0));
        methods
    }
}

impl MethodSource for BTreeMap<String, Method> {
    fn into_methods(self) -> Vec<(String, Method)> {
        self.into_iter().collect()
    }
}

impl MethodSource for &MethodRegistry {
    fn into_methods(self) -> Vec<(String, Method)> {
        self.iter()
            .map(|(name, callable)| (name.to_string(), Rc::clone(callable)))
            .collect()
    }
}

impl MethodSource for MethodRegistry {
    fn into_methods(self) -> Vec<(String, Method)> {
        (&self).into_methods()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn double() -> Method {
        method(|args| {
            let n = args
                .first()
                .and_then(Value::as_i64)
                .ok_or_else(|| RemoteError::failed("expected an integer"))?;
            Ok(json!(n * 2))
        })
    }

    #[test]
    fn invoke_registered_method() {
        let mut registry = MethodRegistry::new();
        assert!(registry.register("double", double()));
        assert!(registry.has("double"));
        assert_eq!(registry.invoke("double", &[json!(21)]).unwrap(), json!(42));
    }

    #[test]
    fn invoke_unknown_method() {
        let registry = MethodRegistry::new();
        let err = registry.invoke("missing", &[]).expect_err("should fail");
        assert_eq!(err.kind, RemoteErrorKind::UnknownMethod);
    }

    #[test]
    fn invoke_name_only_entry() {
        let mut registry = MethodRegistry::new();
        registry.register_name("ghost");
        assert!(registry.has("ghost"));
        let err = registry.invoke("ghost", &[]).expect_err("should fail");
        assert_eq!(err.kind, RemoteErrorKind::NotCallable);
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = MethodRegistry::new();
        registry.register("value", method(|_| Ok(json!(1))));
        assert!(!registry.register("value", method(|_| Ok(json!(2)))));
        assert_eq!(registry.invoke("value", &[]).unwrap(), json!(2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn names_keep_registration_order() {
        let mut registry = MethodRegistry::new();
        registry.register("b", double());
        registry.register("a", double());
        registry.register_name("c");
        assert_eq!(registry.names(), vec!["b", "a", "c"]);
        assert_eq!(registry.manifest().methods, vec!["b", "a", "c"]);
    }

    #[test]
    fn register_all_from_sources() {
        let mut map = BTreeMap::new();
        map.insert("double".to_string(), double());
        map.insert("zero".to_string(), method(|_| Ok(json!(0))));

        let mut registry = MethodRegistry::new();
        let added = registry.register_all(map);
        assert_eq!(added, vec!["double", "zero"]);

        let mut copy = MethodRegistry::new();
        copy.register_name("ghost");
        copy.register_all(&registry);
        assert_eq!(copy.names(), vec!["ghost", "double", "zero"]);
        assert_eq!(copy.invoke("zero", &[]).unwrap(), json!(0));
    }

    #[test]
    fn method_error_is_returned() {
        let mut registry = MethodRegistry::new();
        registry.register("double", double());
        let err = registry
            .invoke("double", &[json!("x")])
            .expect_err("should fail");
        assert_eq!(err.kind, RemoteErrorKind::Failed);
        assert_eq!(err.message, "expected an integer");
    }
}
