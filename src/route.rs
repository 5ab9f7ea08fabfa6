//! Route table and request resolution.
//!
//! Routes are tried longest pattern first, measured in characters of the
//! pattern string. Patterns of equal length keep their registration order.
//! A `:name` segment captures exactly one non-empty path segment.

use std::fmt::{self, Display, Formatter};
use log::debug;
use regex::Regex;
use crate::def::*;
use crate::message::*;

const SEGMENT: &'static str = "[^/]+";

/// Boxed handler taking a context (the dispatcher) and the captured path
/// arguments.
pub type Handler<C> = Box<dyn Fn(&C, &PathArgs) -> Result<Response, HandlerError>>;

/// Named values captured from the request path, in pattern order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PathArgs(Vec<(String, String)>);

impl PathArgs {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn insert(&mut self, name: &str, value: &str) {
        match self.0.iter_mut().find(|(n, _)| n == name) {
            Some(existing) => existing.1 = value.to_string(),
            None => self.0.push((name.to_string(), value.to_string()))
        }
    }
}

impl Display for PathArgs {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let pairs: Vec<String> = self.iter().map(|(n, v)| format!("{:?}: {:?}", n, v)).collect();
        write!(f, "{{{}}}", pairs.join(", "))
    }
}

pub struct Route<C> {
    pattern: String,
    methods: Vec<String>,
    regex: Regex,
    name: &'static str,
    handler: Handler<C>
}

impl<C> Route<C> {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Identity of the bound handler, used in access logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn call(&self, context: &C, args: &PathArgs) -> Result<Response, HandlerError> {
        (self.handler)(context, args)
    }

    fn is_key(&self, pattern: &str, methods: &[String]) -> bool {
        self.pattern == pattern && self.methods == methods
    }

    fn extract(&self, path: &str) -> PathArgs {
        let segments: Vec<&str> = path.split('/').collect();
        let mut args = PathArgs::new();
        for (i, component) in self.pattern.split('/').enumerate() {
            if !component.starts_with(':') { continue }
            match segments.get(i) {
                Some(value) if !value.is_empty() => args.insert(component.trim_start_matches(':'), value),
                _ => {}
            }
        }

        args
    }
}

pub struct Resolved<'a, C> {
    pub route: &'a Route<C>,
    pub args: PathArgs
}

/// Ordered `(pattern, methods) -> handler` bindings.
pub struct RouteTable<C> {
    routes: Vec<Route<C>>
}

impl<C> Default for RouteTable<C> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<C> RouteTable<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes in resolution order.
    pub fn routes(&self) -> std::slice::Iter<'_, Route<C>> {
        self.routes.iter()
    }

    /// Binds `handler` to `pattern` for `methods`. Binding the same pattern
    /// and methods again replaces the handler in place.
    pub fn insert(&mut self, pattern: &str, methods: &[&str], name: &'static str, handler: Handler<C>) -> Result<(), Error> {
        let methods: Vec<String> = methods.iter().map(|m| m.to_string()).collect();
        debug!("Adding route {} for {:?} to {}", pattern, methods, name);

        if let Some(route) = self.routes.iter_mut().find(|r| r.is_key(pattern, &methods)) {
            route.name = name;
            route.handler = handler;
            return Ok(());
        }

        let route = Route { regex: compile(pattern)?, pattern: pattern.to_string(), methods, name, handler };
        let length = pattern.chars().count();
        let at = self.routes.iter().position(|r| r.pattern.chars().count() < length).unwrap_or(self.routes.len());
        self.routes.insert(at, route);
        Ok(())
    }

    pub fn resolve(&self, request: &Request) -> Result<Resolved<'_, C>, HttpException> {
        let path = request.path.as_str();
        for route in self.routes.iter().filter(|r| r.methods.iter().any(|m| *m == request.method)) {
            debug!("Matching {} {} against {:?} {} (regex: {})", request.method, path, route.methods, route.pattern, route.regex);
            if route.regex.is_match(path) {
                debug!("Matched {} {} with {:?} {}", request.method, path, route.methods, route.pattern);
                return Ok(Resolved { route, args: route.extract(path) });
            }
        }

        Err(HttpException::not_found(format!("No route found for request {}", request)))
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    let segments: Vec<String> = pattern.split('/')
        .map(|s| if s.starts_with(':') { SEGMENT.to_string() } else { regex::escape(s) })
        .collect();
    Regex::new(&format!("^{}$", segments.join("/")))
}
