use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use parse_display::Display;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{CANCEL_REQUEST_METHOD, Error, RequestContext, Result, message::from_value_or_null};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display(style = "lowercase")]
pub enum MethodKind {
    Request,
    Notification,
}

/// Name of the Rust type a method's params or result are decoded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{0}")]
pub struct Shape(&'static str);

impl Shape {
    pub fn of<T: ?Sized>() -> Self {
        Self(std::any::type_name::<T>())
    }
    pub fn name(self) -> &'static str {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodEntry {
    name: String,
    kind: MethodKind,
    params: Shape,
    result: Option<Shape>,
}
impl MethodEntry {
    pub fn request<P, R>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MethodKind::Request,
            params: Shape::of::<P>(),
            result: Some(Shape::of::<R>()),
        }
    }
    pub fn notification<P>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MethodKind::Notification,
            params: Shape::of::<P>(),
            result: None,
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> MethodKind {
        self.kind
    }
    pub fn is_notification(&self) -> bool {
        self.kind == MethodKind::Notification
    }
    pub fn params(&self) -> Shape {
        self.params
    }
    pub fn result(&self) -> Option<Shape> {
        self.result
    }
}

/// The set of methods one side of a connection accepts.
///
/// Describes a peer without holding any handlers; pass the peer's interface to
/// [`Launcher::remote_interface`](crate::Launcher::remote_interface) to have calls
/// checked before they are sent.
#[derive(Debug, Clone, Default)]
pub struct Interface {
    entries: HashMap<String, MethodEntry>,
    segment: Option<String>,
}

impl Interface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefixes the names of methods added afterwards with `segment/`.
    pub fn segment(mut self, segment: &str) -> Self {
        self.segment = Some(segment.to_string());
        self
    }
    pub fn request<P, R>(mut self, name: &str) -> Self {
        let name = self.qualify(name);
        self.insert(MethodEntry::request::<P, R>(name));
        self
    }
    pub fn notification<P>(mut self, name: &str) -> Self {
        let name = self.qualify(name);
        self.insert(MethodEntry::notification::<P>(name));
        self
    }

    pub fn resolve(&self, method: &str) -> Option<&MethodEntry> {
        self.entries.get(method)
    }
    pub fn entries(&self) -> impl Iterator<Item = &MethodEntry> {
        self.entries.values()
    }

    fn qualify(&self, name: &str) -> String {
        match &self.segment {
            Some(segment) => format!("{segment}/{name}"),
            None => name.to_string(),
        }
    }
    fn insert(&mut self, entry: MethodEntry) {
        assert!(
            entry.name != CANCEL_REQUEST_METHOD,
            "`{CANCEL_REQUEST_METHOD}` is reserved"
        );
        let name = entry.name.clone();
        assert!(
            self.entries.insert(name.clone(), entry).is_none(),
            "method `{name}` registered twice"
        );
    }
}

/// Parameters of an incoming request or notification.
#[derive(Debug, Clone, Default)]
pub struct Params(Option<Value>);

impl Params {
    pub fn new(params: Option<Value>) -> Self {
        Self(params)
    }

    /// Decodes the params, treating missing params as `null`.
    pub fn to<T>(self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        from_value_or_null(self.0).map_err(Error::invalid_params)
    }
    pub fn to_opt<T>(self) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.0 {
            Some(p) => Ok(Some(serde_json::from_value(p).map_err(Error::invalid_params)?)),
            None => Ok(None),
        }
    }
    pub fn into_value(self) -> Option<Value> {
        self.0
    }
}

type RequestFn<S> =
    Arc<dyn Fn(Arc<S>, Params, RequestContext) -> BoxFuture<Result<Value>> + Send + Sync>;
type NotificationFn<S> = Arc<dyn Fn(&S, Params) -> Result<()> + Send + Sync>;

pub(crate) enum Route<S> {
    Request(RequestFn<S>),
    Notification(NotificationFn<S>),
}

/// Method table of a local service: each method's [`MethodEntry`] and its handler.
///
/// Built once by [`RegistryBuilder`] and read-only afterwards.
pub struct MethodRegistry<S> {
    interface: Interface,
    routes: HashMap<String, Route<S>>,
}

impl<S> MethodRegistry<S>
where
    S: Send + Sync + 'static,
{
    pub fn builder() -> RegistryBuilder<S> {
        RegistryBuilder {
            interface: Interface::new(),
            routes: HashMap::new(),
        }
    }

    pub fn resolve(&self, method: &str) -> Option<&MethodEntry> {
        self.interface.resolve(method)
    }
    pub fn entries(&self) -> impl Iterator<Item = &MethodEntry> {
        self.interface.entries()
    }
    /// The description a peer needs to call this service.
    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    pub(crate) fn route(&self, method: &str) -> Option<&Route<S>> {
        self.routes.get(method)
    }
}

pub struct RegistryBuilder<S> {
    interface: Interface,
    routes: HashMap<String, Route<S>>,
}

impl<S> RegistryBuilder<S>
where
    S: Send + Sync + 'static,
{
    /// Prefixes the names of methods registered afterwards with `segment/`.
    pub fn segment(mut self, segment: &str) -> Self {
        self.interface = self.interface.segment(segment);
        self
    }

    /// Registers a request handler.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered or is `$/cancelRequest`.
    pub fn request<P, R, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(Arc<S>, P, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.interface = self.interface.request::<P, R>(name);
        let f = Arc::new(f);
        let route: RequestFn<S> = Arc::new(
            move |service: Arc<S>, params: Params, cx: RequestContext| -> BoxFuture<Result<Value>> {
                let f = f.clone();
                Box::pin(async move {
                    let result = f(service, params.to()?, cx).await?;
                    Ok::<_, Error>(serde_json::to_value(result)?)
                })
            },
        );
        let name = self.interface.qualify(name);
        self.routes.insert(name, Route::Request(route));
        self
    }

    /// Registers a notification handler.
    ///
    /// Notification handlers run on the message processor in arrival order, so
    /// they should only record state or spawn work.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered or is `$/cancelRequest`.
    pub fn notification<P, F>(mut self, name: &str, f: F) -> Self
    where
        P: DeserializeOwned + 'static,
        F: Fn(&S, P) -> Result<()> + Send + Sync + 'static,
    {
        self.interface = self.interface.notification::<P>(name);
        let route: NotificationFn<S> =
            Arc::new(move |service: &S, params: Params| -> Result<()> { f(service, params.to()?) });
        let name = self.interface.qualify(name);
        self.routes.insert(name, Route::Notification(route));
        self
    }

    pub fn build(self) -> MethodRegistry<S> {
        MethodRegistry {
            interface: self.interface,
            routes: self.routes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Calc;

    fn registry() -> MethodRegistry<Calc> {
        MethodRegistry::builder()
            .request("sum", |_: Arc<Calc>, (a, b): (i64, i64), _| async move { Ok(a + b) })
            .segment("window")
            .notification("logMessage", |_: &Calc, _: String| Ok(()))
            .build()
    }

    #[test]
    fn resolve_entries() {
        let r = registry();
        let sum = r.resolve("sum").unwrap();
        assert_eq!(sum.kind(), MethodKind::Request);
        assert_eq!(sum.params(), Shape::of::<(i64, i64)>());
        assert_eq!(sum.result(), Some(Shape::of::<i64>()));

        let log = r.resolve("window/logMessage").unwrap();
        assert!(log.is_notification());
        assert_eq!(log.params().name(), "alloc::string::String");
        assert_eq!(log.result(), None);

        assert!(r.resolve("logMessage").is_none());
        assert_eq!(r.entries().count(), 2);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        let _ = Interface::new().request::<(), ()>("a").request::<(), ()>("a");
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn cancel_method_is_reserved() {
        let _ = Interface::new().notification::<Value>(CANCEL_REQUEST_METHOD);
    }

    #[test]
    fn params_missing_is_null() {
        assert_eq!(Params::new(None).to::<Option<i32>>().unwrap(), None);
        Params::new(None).to::<()>().unwrap();
        let e = Params::new(None).to::<(i32, i32)>().unwrap_err();
        assert_eq!(e.code(), crate::ErrorCode::INVALID_PARAMS);
        assert_eq!(Params::new(None).to_opt::<i32>().unwrap(), None);
    }
}
