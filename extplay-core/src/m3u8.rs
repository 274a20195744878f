//! HLS master playlist resolution.
//!
//! Fetches a `.m3u8` URL over a plain HTTP/1.1 connection (TLS when the
//! scheme asks for it), verifies the response is a master playlist and
//! extracts its variant streams. Media playlists are rejected so they
//! fall through to the player untouched.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use url::Url;

const DEFAULT_USER_AGENT: &str = "Enigma2 HbbTV/1.1.1 (+PVR+RTSP+DL;OpenPLi;;;)";
const REDIRECT_LIMIT: usize = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// The playlist header must appear within this many content lines.
const HEADER_LINE_LIMIT: usize = 5;

/// Content types a playlist response may declare.
const PLAYLIST_CONTENT_TYPES: [&str; 6] = [
    "application/text",
    "audio/x-mpegurl",
    "application/x-mpegurl",
    "application/vnd.apple.mpegurl",
    "audio/mpegurl",
    "application/m3u",
];

#[derive(Debug, Error)]
pub enum M3u8Error {
    #[error("not a valid playlist url: {0}")]
    BadUrl(#[from] url::ParseError),
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("connect to {host} failed: {source}")]
    Connect {
        host: String,
        source: std::io::Error,
    },
    #[error("i/o with {host} failed: {source}")]
    Io {
        host: String,
        source: std::io::Error,
    },
    #[error("tls handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },
    #[error("server answered with status {0}")]
    BadStatus(u16),
    #[error("unsupported content type: {0}")]
    UnsupportedContent(String),
    #[error("redirect without a location header")]
    MissingLocation,
    #[error("not an HLS master playlist")]
    NotMasterPlaylist,
    #[error("master playlist carries no variant streams")]
    NoVariants,
}

/// One variant stream of a master playlist, with the headers needed to
/// fetch it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct M3u8StreamInfo {
    pub url: String,
    pub bitrate: u64,
    pub resolution: String,
    pub codecs: String,
    pub headers: HashMap<String, String>,
}

/// Quick check whether a URL is worth probing as an HLS playlist.
pub fn is_m3u8_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https") && parsed.path().ends_with(".m3u8")
        }
        Err(_) => false,
    }
}

/// Resolver for one master playlist URL.
pub struct VariantExplorer {
    url: String,
    headers: HashMap<String, String>,
}

impl VariantExplorer {
    pub fn new(url: &str, headers: &HashMap<String, String>) -> Self {
        VariantExplorer {
            url: url.to_string(),
            headers: headers.clone(),
        }
    }

    /// Fetch the playlist and return its variants, highest bitrate first.
    pub fn variants(&self) -> Result<Vec<M3u8StreamInfo>, M3u8Error> {
        let mut headers = self.headers.clone();
        if !headers
            .keys()
            .any(|key| key.eq_ignore_ascii_case("user-agent"))
        {
            headers.insert("User-Agent".to_string(), DEFAULT_USER_AGENT.to_string());
        }
        let mut variants = fetch(&self.url, headers, 0)?;
        if variants.is_empty() {
            return Err(M3u8Error::NoVariants);
        }
        variants.sort_by(|a, b| b.bitrate.cmp(&a.bitrate));
        Ok(variants)
    }
}

fn fetch(
    url: &str,
    headers: HashMap<String, String>,
    depth: usize,
) -> Result<Vec<M3u8StreamInfo>, M3u8Error> {
    if depth > REDIRECT_LIMIT {
        return Err(M3u8Error::TooManyRedirects);
    }
    let parsed = Url::parse(url)?;
    let host = parsed
        .host_str()
        .ok_or(url::ParseError::EmptyHost)?
        .to_string();
    let port = parsed.port_or_known_default().unwrap_or(80);

    let io_err = |source: std::io::Error| M3u8Error::Io {
        host: host.clone(),
        source,
    };

    let mut stream = connect(&parsed, &host, port)?;

    let mut target = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        target.push('?');
        target.push_str(query);
    }
    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\nConnection: close\r\n",
        target, host
    );
    for (key, value) in &headers {
        request.push_str(key);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).map_err(io_err)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).map_err(io_err)?;
    let status: u16 = line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or(M3u8Error::BadStatus(0))?;

    let mut content_type = String::new();
    let mut content_length: Option<usize> = None;
    let mut location = None;
    let mut cookies = Vec::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).map_err(io_err)?;
        let trimmed = line.trim_end();
        if n == 0 || trimmed.is_empty() {
            break;
        }
        let Some((name, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.to_ascii_lowercase().as_str() {
            // Parameters like charset are irrelevant for the type check.
            "content-type" => {
                content_type = value
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_ascii_lowercase()
            }
            "content-length" => content_length = value.parse().ok(),
            "location" => location = Some(value.to_string()),
            "set-cookie" => {
                if let Some(pair) = value.split(';').next() {
                    cookies.push(pair.trim().to_string());
                }
            }
            _ => {}
        }
    }

    if status == 301 || status == 302 {
        let location = location.ok_or(M3u8Error::MissingLocation)?;
        let next = parsed.join(&location)?;
        tracing::debug!("playlist redirect ({}) to {}", status, next);
        let mut headers = headers;
        if !cookies.is_empty() {
            headers.insert("Cookie".to_string(), cookies.join("; "));
        }
        return fetch(next.as_str(), headers, depth + 1);
    }
    if status != 200 {
        return Err(M3u8Error::BadStatus(status));
    }
    if !content_type.is_empty() && !PLAYLIST_CONTENT_TYPES.contains(&content_type.as_str()) {
        return Err(M3u8Error::UnsupportedContent(content_type));
    }

    parse_master_playlist(&mut reader, &parsed, &headers, content_length).map_err(|e| match e {
        ParseAbort::Io(source) => io_err(source),
        ParseAbort::BadVariantUrl(source) => M3u8Error::BadUrl(source),
        ParseAbort::NotMaster => M3u8Error::NotMasterPlaylist,
    })
}

enum ParseAbort {
    Io(std::io::Error),
    BadVariantUrl(url::ParseError),
    NotMaster,
}

fn parse_master_playlist<R: BufRead>(
    reader: &mut R,
    base: &Url,
    headers: &HashMap<String, String>,
    content_length: Option<usize>,
) -> Result<Vec<M3u8StreamInfo>, ParseAbort> {
    let mut found_header = false;
    let mut lines_seen = 0usize;
    let mut consumed = 0usize;
    let mut pending: Option<(u64, String, String)> = None;
    let mut variants = Vec::new();
    let mut line = String::new();

    loop {
        if content_length.map_or(false, |length| consumed >= length) {
            break;
        }
        line.clear();
        let n = reader.read_line(&mut line).map_err(ParseAbort::Io)?;
        if n == 0 {
            break;
        }
        consumed += n;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        lines_seen += 1;

        if !found_header {
            if trimmed == "#EXTM3U" {
                found_header = true;
            } else if lines_seen >= HEADER_LINE_LIMIT {
                return Err(ParseAbort::NotMaster);
            }
            continue;
        }
        // A media sequence marks a media playlist, not a master one.
        if trimmed.starts_with("#EXT-X-MEDIA-SEQUENCE") {
            return Err(ParseAbort::NotMaster);
        }
        if let Some(attributes) = trimmed.strip_prefix("#EXT-X-STREAM-INF:") {
            pending = Some(parse_stream_inf(attributes));
            continue;
        }
        if trimmed.starts_with('#') {
            continue;
        }
        if let Some((bitrate, resolution, codecs)) = pending.take() {
            let absolute = base.join(trimmed).map_err(ParseAbort::BadVariantUrl)?;
            variants.push(M3u8StreamInfo {
                url: absolute.to_string(),
                bitrate,
                resolution,
                codecs,
                headers: headers.clone(),
            });
        }
    }

    if !found_header {
        return Err(ParseAbort::NotMaster);
    }
    Ok(variants)
}

/// Split an attribute list on commas, ignoring commas inside quoted
/// values (CODECS carries them).
fn split_attributes(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in input.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn parse_stream_inf(attributes: &str) -> (u64, String, String) {
    let mut bitrate = 0;
    let mut resolution = String::new();
    let mut codecs = String::new();
    for attribute in split_attributes(attributes) {
        let Some((key, value)) = attribute.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim().to_ascii_uppercase().as_str() {
            "BANDWIDTH" => bitrate = value.parse().unwrap_or(0),
            "RESOLUTION" => resolution = value.to_string(),
            "CODECS" => codecs = value.to_string(),
            _ => {}
        }
    }
    (bitrate, resolution, codecs)
}

// ============================================================================
// Transport
// ============================================================================

enum PlaylistStream {
    Plain(TcpStream),
    Tls(Box<native_tls::TlsStream<TcpStream>>),
}

impl Read for PlaylistStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            PlaylistStream::Plain(s) => s.read(buf),
            PlaylistStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for PlaylistStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            PlaylistStream::Plain(s) => s.write(buf),
            PlaylistStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            PlaylistStream::Plain(s) => s.flush(),
            PlaylistStream::Tls(s) => s.flush(),
        }
    }
}

fn connect(url: &Url, host: &str, port: u16) -> Result<PlaylistStream, M3u8Error> {
    let connect_err = |source: std::io::Error| M3u8Error::Connect {
        host: host.to_string(),
        source,
    };
    let tls_err = |reason: String| M3u8Error::Tls {
        host: host.to_string(),
        reason,
    };

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(connect_err)?
        .next()
        .ok_or_else(|| {
            connect_err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "hostname resolved to no address",
            ))
        })?;
    let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(connect_err)?;
    tcp.set_read_timeout(Some(READ_TIMEOUT)).map_err(connect_err)?;

    if url.scheme() != "https" {
        return Ok(PlaylistStream::Plain(tcp));
    }

    let connector = native_tls::TlsConnector::new().map_err(|e| tls_err(e.to_string()))?;
    match connector.connect(host, tcp) {
        Ok(stream) => Ok(PlaylistStream::Tls(Box::new(stream))),
        Err(e) => {
            // Many boxes carry self-signed or expired station certificates;
            // the stream is still worth playing.
            tracing::warn!(
                "certificate verification for {} failed ({}), retrying without verification",
                host,
                e
            );
            let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(connect_err)?;
            tcp.set_read_timeout(Some(READ_TIMEOUT)).map_err(connect_err)?;
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| tls_err(e.to_string()))?;
            connector
                .connect(host, tcp)
                .map(|stream| PlaylistStream::Tls(Box::new(stream)))
                .map_err(|e| tls_err(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_probe_requires_http_and_playlist_suffix() {
        assert!(is_m3u8_url("http://host/live/master.m3u8"));
        assert!(is_m3u8_url("https://host/master.m3u8?token=1"));
        assert!(!is_m3u8_url("http://host/video.mp4"));
        assert!(!is_m3u8_url("rtmp://host/master.m3u8"));
        assert!(!is_m3u8_url("not a url"));
    }

    #[test]
    fn stream_inf_attributes_parse_case_insensitively() {
        let (bitrate, resolution, codecs) =
            parse_stream_inf(r#"bandwidth=512000,Resolution=1280x720,CODECS="avc1.4d401f,mp4a.40.2""#);
        assert_eq!(bitrate, 512000);
        assert_eq!(resolution, "1280x720");
        // The comma inside the quoted value does not split the list.
        assert_eq!(codecs, "avc1.4d401f,mp4a.40.2");
    }

    #[test]
    fn unknown_attributes_are_ignored() {
        let (bitrate, resolution, codecs) =
            parse_stream_inf("PROGRAM-ID=1,BANDWIDTH=abc,FRAME-RATE=25");
        assert_eq!(bitrate, 0);
        assert!(resolution.is_empty());
        assert!(codecs.is_empty());
    }

    // ------------------------------------------------------------------
    // Fixture servers
    // ------------------------------------------------------------------

    fn http_response(status: &str, content_type: &str, extra: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n{}\r\n{}",
            status,
            content_type,
            body.len(),
            extra,
            body
        )
    }

    /// Serve one canned response, returning the base URL and a handle
    /// yielding the raw request.
    fn serve_once(response: String) -> (String, std::thread::JoinHandle<String>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    #[test]
    fn master_playlist_variants_come_back_bitrate_descending() {
        let body = "#EXTM3U\n\
                    #EXT-X-STREAM-INF:BANDWIDTH=256000,RESOLUTION=640x360\n\
                    low/index.m3u8\n\
                    #EXT-X-STREAM-INF:BANDWIDTH=512000,RESOLUTION=1280x720,CODECS=\"avc1.4d401f,mp4a.40.2\"\n\
                    high/index.m3u8\n";
        let (base, server) = serve_once(http_response(
            "200 OK",
            "application/vnd.apple.mpegurl",
            "",
            body,
        ));

        let url = format!("{}/live/master.m3u8", base);
        let variants = VariantExplorer::new(&url, &HashMap::new())
            .variants()
            .expect("variants");

        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0].bitrate, 512000);
        assert_eq!(variants[0].url, format!("{}/live/high/index.m3u8", base));
        assert_eq!(variants[0].codecs, "avc1.4d401f,mp4a.40.2");
        assert_eq!(variants[1].bitrate, 256000);
        assert_eq!(variants[1].resolution, "640x360");

        let request = server.join().unwrap();
        assert!(request.starts_with("GET /live/master.m3u8 HTTP/1.1\r\n"));
        assert!(request.contains(DEFAULT_USER_AGENT));
    }

    #[test]
    fn redirects_are_followed_with_their_cookies() {
        let body = "#EXTM3U\n\
                    #EXT-X-STREAM-INF:BANDWIDTH=128000\n\
                    only.m3u8\n";
        let (target_base, target) = serve_once(http_response(
            "200 OK",
            "application/x-mpegurl",
            "",
            body,
        ));
        let location = format!("{}/moved/master.m3u8", target_base);
        let (base, _redirector) = serve_once(format!(
            "HTTP/1.1 301 Moved Permanently\r\nLocation: {}\r\nSet-Cookie: session=abc; Path=/\r\nContent-Length: 0\r\n\r\n",
            location
        ));

        let url = format!("{}/master.m3u8", base);
        let variants = VariantExplorer::new(&url, &HashMap::new())
            .variants()
            .expect("variants");
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].url, format!("{}/moved/only.m3u8", target_base));

        let request = target.join().unwrap();
        assert!(request.contains("Cookie: session=abc"));
    }

    #[test]
    fn redirect_loops_are_cut_off() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{}/master.m3u8", addr);
        let self_url = url.clone();
        std::thread::spawn(move || {
            for _ in 0..4 {
                let (mut stream, _) = listener.accept().unwrap();
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(
                    format!(
                        "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\n\r\n",
                        self_url
                    )
                    .as_bytes(),
                );
            }
        });

        match VariantExplorer::new(&url, &HashMap::new()).variants() {
            Err(M3u8Error::TooManyRedirects) => {}
            other => panic!("expected TooManyRedirects, got {other:?}"),
        }
    }

    #[test]
    fn media_playlists_are_rejected() {
        let body = "#EXTM3U\n\
                    #EXT-X-MEDIA-SEQUENCE:0\n\
                    #EXTINF:10.0,\n\
                    segment0.ts\n";
        let (base, _server) = serve_once(http_response(
            "200 OK",
            "application/vnd.apple.mpegurl",
            "",
            body,
        ));
        let url = format!("{}/chunks.m3u8", base);
        match VariantExplorer::new(&url, &HashMap::new()).variants() {
            Err(M3u8Error::NotMasterPlaylist) => {}
            other => panic!("expected NotMasterPlaylist, got {other:?}"),
        }
    }

    #[test]
    fn wrong_content_type_is_rejected() {
        let (base, _server) = serve_once(http_response(
            "200 OK",
            "text/html; charset=utf-8",
            "",
            "<html></html>",
        ));
        let url = format!("{}/master.m3u8", base);
        match VariantExplorer::new(&url, &HashMap::new()).variants() {
            Err(M3u8Error::UnsupportedContent(kind)) => assert_eq!(kind, "text/html"),
            other => panic!("expected UnsupportedContent, got {other:?}"),
        }
    }

    #[test]
    fn master_without_variants_is_an_error() {
        let (base, _server) = serve_once(http_response(
            "200 OK",
            "audio/mpegurl",
            "",
            "#EXTM3U\n#EXT-X-VERSION:3\n",
        ));
        let url = format!("{}/master.m3u8", base);
        match VariantExplorer::new(&url, &HashMap::new()).variants() {
            Err(M3u8Error::NoVariants) => {}
            other => panic!("expected NoVariants, got {other:?}"),
        }
    }
}
