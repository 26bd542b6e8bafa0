use crate::error::{AppError, AppResult};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};
use url::Url;

pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(180);

const SUCCESS_BODY: &str =
    "<html><body><h1>Sign-in complete</h1><p>You can close this window.</p></body></html>";
const FAILURE_BODY: &str = "<html><body><h1>Sign-in failed</h1><p>You can return to the terminal and retry.</p></body></html>";

/// Loopback listener standing in for the browser page the provider redirects back to.
pub struct CallbackServer {
    listener: TcpListener,
    origin: String,
    expected_path: String,
    timeout: Duration,
}

impl CallbackServer {
    pub fn bind(redirect_uri: &str, timeout: Duration) -> AppResult<Self> {
        let parsed = Url::parse(redirect_uri)
            .map_err(|err| AppError::configuration(format!("Invalid redirectUri: {err}")))?;

        if parsed.scheme() != "http" {
            return Err(AppError::configuration(
                "redirectUri for CLI login must use http loopback (for example http://127.0.0.1:45455/callback).",
            ));
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| AppError::configuration("redirectUri must include a host."))?;

        if host != "127.0.0.1" && host != "localhost" {
            return Err(AppError::configuration(
                "redirectUri host must be localhost or 127.0.0.1 for CLI login.",
            ));
        }

        let port = parsed.port().ok_or_else(|| {
            AppError::configuration(
                "redirectUri must include an explicit port for local callback handling.",
            )
        })?;

        let bind_addr = format!("127.0.0.1:{port}");
        let listener = TcpListener::bind(&bind_addr).map_err(|err| {
            AppError::auth(format!(
                "Failed to bind callback server on {bind_addr}: {err}"
            ))
        })?;

        Self::from_listener(
            listener,
            format!("http://{host}:{port}"),
            parsed.path(),
            timeout,
        )
    }

    fn from_listener(
        listener: TcpListener,
        origin: String,
        path: &str,
        timeout: Duration,
    ) -> AppResult<Self> {
        listener
            .set_nonblocking(true)
            .map_err(|err| AppError::auth(format!("Failed to configure callback server: {err}")))?;

        let expected_path = if path.is_empty() {
            "/".to_string()
        } else {
            path.to_string()
        };

        Ok(Self {
            listener,
            origin,
            expected_path,
            timeout,
        })
    }

    /// Blocks until the provider redirects back and returns the full return address.
    pub fn wait_for_return(self) -> AppResult<String> {
        let deadline = Instant::now() + self.timeout;

        while Instant::now() < deadline {
            match self.listener.accept() {
                Ok((mut stream, _addr)) => {
                    stream.set_nonblocking(false).map_err(|err| {
                        AppError::auth(format!("Failed to configure callback stream: {err}"))
                    })?;
                    let target = read_callback_target(&mut stream, &self.expected_path)?;
                    return Ok(format!("{}{target}", self.origin));
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(err) => {
                    return Err(AppError::auth(format!(
                        "Failed to receive callback request: {err}"
                    )));
                }
            }
        }

        Err(AppError::auth(
            "Timed out waiting for OAuth callback. Try login again.",
        ))
    }
}

fn read_callback_target(stream: &mut TcpStream, expected_path: &str) -> AppResult<String> {
    let mut buffer = [0_u8; 8192];
    let bytes_read = stream
        .read(&mut buffer)
        .map_err(|err| AppError::auth(format!("Failed to read callback request: {err}")))?;

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    let first_line = request
        .lines()
        .next()
        .ok_or_else(|| AppError::auth("Received malformed callback request."))?;

    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();

    if method != "GET" {
        write_response(stream, "405 Method Not Allowed", FAILURE_BODY)?;
        return Err(AppError::auth(
            "Callback request used unsupported HTTP method.",
        ));
    }

    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    if path != expected_path {
        write_response(stream, "404 Not Found", FAILURE_BODY)?;
        return Err(AppError::auth(format!(
            "Callback path mismatch. Expected {expected_path}, got {path}."
        )));
    }

    let denied = url::form_urlencoded::parse(query.as_bytes()).any(|(key, _)| key == "error");
    let body = if denied { FAILURE_BODY } else { SUCCESS_BODY };
    write_response(stream, "200 OK", body)?;

    Ok(target.to_string())
}

fn write_response(stream: &mut TcpStream, status: &str, body: &str) -> AppResult<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );

    stream
        .write_all(response.as_bytes())
        .map_err(|err| AppError::auth(format!("Failed to write callback response: {err}")))?;
    stream
        .flush()
        .map_err(|err| AppError::auth(format!("Failed to flush callback response: {err}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_server() -> (CallbackServer, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = CallbackServer::from_listener(
            listener,
            format!("http://127.0.0.1:{port}"),
            "/callback",
            Duration::from_secs(5),
        )
        .unwrap();
        (server, port)
    }

    fn send(port: u16, request_line: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .write_all(format!("{request_line}\r\nHost: localhost\r\n\r\n").as_bytes())
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn returns_full_return_address() {
        let (server, port) = local_server();
        let client = thread::spawn(move || send(port, "GET /callback?code=xyz&state=s1 HTTP/1.1"));

        let url = server.wait_for_return().unwrap();

        assert_eq!(url, format!("http://127.0.0.1:{port}/callback?code=xyz&state=s1"));
        assert!(client.join().unwrap().starts_with("HTTP/1.1 200 OK"));
    }

    #[test]
    fn rejects_unexpected_path() {
        let (server, port) = local_server();
        let client = thread::spawn(move || send(port, "GET /favicon.ico HTTP/1.1"));

        let err = server.wait_for_return().unwrap_err();

        assert!(err.message.contains("Callback path mismatch"));
        assert!(client.join().unwrap().starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn bind_rejects_remote_hosts() {
        let err = CallbackServer::bind("https://example.com/callback", CALLBACK_TIMEOUT)
            .err()
            .unwrap();
        assert!(err.message.contains("http loopback"));
    }
}
