//! Dashboard page listing the discovered services.
//!
//! Served for requests addressed to `localhost` (or `_.localhost`). Rendering
//! never fails on registry trouble; an empty service list produces an
//! empty-state page.

use crate::proxy::error::ProxyError;
use crate::proxy::route::full_body;
use crate::registry::ServiceEntry;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::{Response, StatusCode};

/// Render the service list as an HTML page.
pub fn render(
    entries: &[ServiceEntry],
    listen_port: u16,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    let mut body = String::from(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>namedock</title>\n\
         <style>\n\
         body { font-family: sans-serif; margin: 2em; }\n\
         table { border-collapse: collapse; }\n\
         th, td { padding: 0.4em 1em; border-bottom: 1px solid #ccc; text-align: left; }\n\
         </style>\n</head>\n<body>\n<h1>namedock</h1>\n",
    );

    if entries.is_empty() {
        body.push_str(
            "<p>No services found. Start a process with \
             <code>NAMEDOCK_NAME=&lt;name&gt;</code> set and a listening TCP port, \
             then reload this page.</p>\n",
        );
    } else {
        body.push_str("<table>\n<tr><th>Service</th><th>Port</th><th>PID</th><th>Command</th></tr>\n");
        for entry in entries {
            let name = escape_html(&entry.name);
            body.push_str(&format!(
                "<tr><td><a href=\"http://{name}.localhost:{port}/\">{name}</a></td>\
                 <td>{backend}</td><td>{pid}</td><td><code>{command}</code></td></tr>\n",
                name = name,
                port = listen_port,
                backend = entry.port,
                pid = entry.pid,
                command = escape_html(&entry.command),
            ));
        }
        body.push_str("</table>\n");
    }

    body.push_str("</body>\n</html>\n");

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(full_body(body))?)
}

/// Minimal HTML escaping for untrusted names and command lines.
fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}
