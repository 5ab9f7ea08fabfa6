use std::cell::RefCell;
use std::io;
use std::net::ToSocketAddrs;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use log::{debug, info, log_enabled, Level, LevelFilter};
use crate::def::*;
use crate::message::*;
use crate::route::*;
use crate::transport::Transport;

/// The dispatcher: route bindings, the current request and the debug flag.
///
/// `handle` runs to completion without suspending, but the current request
/// slot is shared. When connections overlap under the cooperative transport
/// it holds whichever request was parsed last.
pub struct App {
    name: String,
    routes: RouteTable<App>,
    request: RefCell<Option<Rc<Request>>>,
    debug: bool
}

impl App {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), routes: RouteTable::new(), request: RefCell::new(None), debug: false }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Debug mode logs at debug level and propagates handler failures after
    /// building their 500 response.
    pub fn set_debug(&mut self, debug: bool) -> &mut Self {
        self.debug = debug;
        self
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Binds `handler` to `pattern` for `methods`.
    ///
    /// ```ignore
    /// app.route("/hello/:name", &["GET"], |_, args| {
    ///     Ok(format!("Hello {}", args.get("name").unwrap_or("stranger")))
    /// })?;
    /// ```
    pub fn route<F, R>(&mut self, pattern: &str, methods: &[&str], handler: F) -> Result<&mut Self, Error>
    where F: Fn(&App, &PathArgs) -> Result<R, HandlerError> + 'static, R: IntoResponse {
        let name = std::any::type_name::<F>();
        let handler: Handler<App> = Box::new(move |app: &App, args: &PathArgs| handler(app, args).map(IntoResponse::into_response));
        self.routes.insert(pattern, methods, name, handler)?;
        Ok(self)
    }

    pub fn routes(&self) -> &RouteTable<App> {
        &self.routes
    }

    /// The most recently parsed request.
    pub fn request(&self) -> Option<Rc<Request>> {
        self.request.borrow().clone()
    }

    /// Turns one raw request into a response.
    ///
    /// Parse failures are returned as errors; every parsed request yields a
    /// response, including when its handler panics. In debug mode a handler failure is returned as
    /// [`Error::Handler`] carrying the response that was built for it.
    pub fn handle(&self, raw: &[u8]) -> Result<Response, Error> {
        debug!("Handling request: {:?}", String::from_utf8_lossy(raw));
        let request = Rc::new(Request::parse(raw)?);
        *self.request.borrow_mut() = Some(Rc::clone(&request));

        let (resolved, result) = match self.routes.resolve(&request) {
            Ok(resolved) => {
                let result = panic::catch_unwind(AssertUnwindSafe(|| resolved.route.call(self, &resolved.args)))
                    .unwrap_or_else(|payload| Err(HandlerError::panic(payload)));
                (Some(resolved), result)
            }
            Err(exception) => (None, Err(HandlerError::from(exception)))
        };

        let mut failure = None;
        let response = match result.map_err(HandlerError::into_exception) {
            Ok(response) => response,
            Err(Ok(exception)) => Response::text(exception.message).with_status(exception.status.code()),
            Err(Err(error)) => {
                let response = Response::text(error.to_string()).with_status(Status::INTERNAL_SERVER_ERROR.code());
                if self.debug { failure = Some(error) }
                response
            }
        };

        if log_enabled!(Level::Debug) {
            debug!("Computed response: {:?}", String::from_utf8_lossy(&response.clone().render()));
        }
        match &resolved {
            Some(resolved) => info!("{} {} -> {} {} {} -> {}", request.method, request.path,
                resolved.route.pattern(), resolved.args, resolved.route.name(), response.status),
            None => info!("{} {} -> None None None -> {}", request.method, request.path, response.status)
        }

        match failure {
            Some(error) => Err(Error::Handler { kind: error.kind(), message: error.message(), response: Box::new(response) }),
            None => Ok(response)
        }
    }

    /// Serves forever on `host:port` with the given transport.
    pub fn run<T: Transport + ?Sized>(self, host: &str, port: u16, transport: &T) -> Result<(), Error> {
        let addr = (host, port).to_socket_addrs()?.next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, format!("cannot resolve {}:{}", host, port)))?;
        info!("Running HTTP Server {} on {}:{} (debug: {})", transport.name(), host, port, self.debug);
        if self.debug && log::max_level() < LevelFilter::Debug {
            log::set_max_level(LevelFilter::Debug);
        }

        transport.run(Rc::new(self), addr)
    }
}
