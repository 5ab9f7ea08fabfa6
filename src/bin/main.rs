// Try:
//     curl -i localhost
//     curl -i localhost/hello/world
//     curl -i -XPUT localhost --data 'Some plain text'
//     curl -i -XPUT localhost --data '{"world": "hello"}'

use std::path::Path;
use log::LevelFilter;
use serde_json::json;
use mhttp::{App, Config, Error, HandlerError, PathArgs, Response};

const CONFIG: &'static str = "mhttp.toml";

fn echo(app: &App, _: &PathArgs) -> Result<Response, HandlerError> {
    let request = app.request().ok_or_else(|| HandlerError::msg("no current request"))?;
    let headers: serde_json::Map<_, _> = request.headers.list()
        .map(|h| (h.name.clone(), json!(h.value)))
        .collect();

    Ok(Response::json(&json!({
        "method": request.method,
        "headers": headers,
        "path": request.path,
        "body": request.body,
        "json": request.json(true)?
    })))
}

fn main() -> Result<(), Error> {
    let config = if Path::new(CONFIG).exists() { Config::load(CONFIG)? } else { Config::default() };
    env_logger::Builder::new()
        .filter_level(if config.debug { LevelFilter::Debug } else { LevelFilter::Info })
        .parse_default_env()
        .init();

    let mut app = App::new("httpbin");
    app.set_debug(config.debug)
        .route("/", &["GET"], |_, _| Ok(json!({"hello": "world"})))?
        .route("/", &["PUT"], echo)?
        .route("/hello/:name", &["GET"], |_, args| Ok(format!("Hello {}", args.get("name").unwrap_or("stranger"))))?;

    let transport = config.transport();
    app.run(&config.host, config.port, transport.as_ref())
}
