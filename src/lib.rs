//! Minimal HTTP request dispatch: parse a raw request, resolve it against a
//! route table, call the bound handler and render the response, over either
//! a cooperative or a polling socket driver.

pub mod def;
pub mod message;
pub mod route;
pub mod http;
pub mod transport;
pub mod config;

pub use crate::config::{Config, Driver};
pub use crate::def::{Error, HandlerError, HttpException, ParsingError, Status};
pub use crate::http::App;
pub use crate::message::{IntoResponse, Request, Response};
pub use crate::route::PathArgs;
pub use crate::transport::{Cooperative, Polling, Tick, Transport};
