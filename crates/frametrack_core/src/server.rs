use std::io::Read;

use anyhow::{Result, anyhow};
use tiny_http::{Header, Request, Response, Server};
use tracing::{info, warn};

use crate::web::{MAX_FORM_BYTES, WebApp, WebRequest, WebResponse};

/// Serve the tracker page until the process is stopped. Requests are handled one at a time.
pub fn serve(app: &WebApp, bind: &str) -> Result<()> {
    let server = Server::http(bind).map_err(|error| anyhow!("failed to bind {bind}: {error}"))?;
    info!(
        bind,
        items = app.catalog().items.len(),
        "progress tracker listening on http://{bind}/"
    );
    handle_requests(app, &server);
    Ok(())
}

/// Answer requests on `server` until it is unblocked.
pub fn handle_requests(app: &WebApp, server: &Server) {
    for mut request in server.incoming_requests() {
        let method = request.method().to_string();
        let url = request.url().to_string();
        let response = match read_body(&mut request) {
            Ok(Some(body)) => app.handle(&WebRequest {
                method: &method,
                url: &url,
                body: &body,
            }),
            Ok(None) => WebResponse::error_page(
                413,
                "Request too large",
                &format!("form bodies are limited to {MAX_FORM_BYTES} bytes"),
            ),
            Err(error) => WebResponse::error_page(400, "Bad request", &format!("{error:#}")),
        };
        info!(method = %method, url = %url, status = response.status, "request handled");

        if let Err(error) = respond(request, response) {
            warn!(error = %error, "failed to write response");
        }
    }
}

fn read_body(request: &mut Request) -> Result<Option<String>> {
    if request
        .body_length()
        .is_some_and(|length| length > MAX_FORM_BYTES)
    {
        return Ok(None);
    }
    let mut body = String::new();
    Read::take(request.as_reader(), MAX_FORM_BYTES as u64 + 1)
        .read_to_string(&mut body)
        .map_err(|error| anyhow!("request body is not valid UTF-8 text: {error}"))?;
    if body.len() > MAX_FORM_BYTES {
        return Ok(None);
    }
    Ok(Some(body))
}

fn respond(request: Request, response: WebResponse) -> Result<()> {
    let mut reply = Response::from_string(response.body).with_status_code(response.status);
    reply.add_header(header("Content-Type", response.content_type)?);
    if let Some(location) = response.location.as_deref() {
        reply.add_header(header("Location", location)?);
    }
    request
        .respond(reply)
        .map_err(|error| anyhow!("failed to send response: {error}"))
}

fn header(name: &str, value: &str) -> Result<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes())
        .map_err(|()| anyhow!("invalid header {name}: {value}"))
}
