//! Proxy configuration rendering.
//!
//! The route table is turned into a tree of [`Directive`]s first and only
//! serialized at the end, so quoting lives in exactly one place.  Rendering
//! is pure: the same table always yields byte-identical text.

use std::collections::HashSet;
use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use crate::error::RenderError;
use crate::routes::RouteTable;
use crate::types::ContainerRecord;

const HEADER: &str = "Generated by proxied; changes are overwritten.";

/// Variable carrying the `Connection` header value for upgraded requests.
const CONNECTION_VAR: &str = "$proxied_connection_upgrade";

const PROXY_TIMEOUT: &str = "60s";

/// One directive of proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Comment(String),
    Simple {
        name: String,
        args: Vec<String>,
    },
    Block {
        name: String,
        args: Vec<String>,
        body: Vec<Directive>,
    },
}

impl Directive {
    pub fn simple<I, S>(name: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Directive::Simple {
            name: name.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn block<I, S>(name: &str, args: I, body: Vec<Directive>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Directive::Block {
            name: name.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            body,
        }
    }

    fn write_to(&self, out: &mut String, depth: usize) {
        let indent = "    ".repeat(depth);
        match self {
            Directive::Comment(text) => {
                let _ = writeln!(out, "{}# {}", indent, text);
            }
            Directive::Simple { name, args } => {
                let _ = writeln!(out, "{}{};", indent, head(name, args));
            }
            Directive::Block { name, args, body } => {
                let _ = writeln!(out, "{}{} {{", indent, head(name, args));
                for directive in body {
                    directive.write_to(out, depth + 1);
                }
                let _ = writeln!(out, "{}}}", indent);
            }
        }
    }
}

fn head(name: &str, args: &[String]) -> String {
    let mut line = name.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&quote(arg));
    }
    line
}

/// Quote an argument when it would otherwise be split or terminated early.
fn quote(arg: &str) -> String {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '#' | '"' | '\''));
    if !needs_quotes {
        return arg.to_string();
    }
    let escaped = arg.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Serialize a list of top-level directives under the generated-file header.
pub fn serialize(items: &[Directive]) -> String {
    let mut out = String::new();
    Directive::Comment(HEADER.to_string()).write_to(&mut out, 0);
    for item in items {
        out.push('\n');
        item.write_to(&mut out, 0);
    }
    out
}

/// Rendered upstream and location text.  Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigArtifact {
    upstreams: String,
    locations: String,
}

impl ConfigArtifact {
    pub fn new(upstreams: String, locations: String) -> Self {
        Self {
            upstreams,
            locations,
        }
    }

    pub fn upstreams(&self) -> &str {
        &self.upstreams
    }

    pub fn locations(&self) -> &str {
        &self.locations
    }

    /// Hex SHA-256 over both parts.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.upstreams.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.locations.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Strips a location prefix before the request is forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixRewrite {
    prefix: String,
}

impl PrefixRewrite {
    /// `prefix` must be normalized (leading and trailing slash).
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn pattern(&self) -> String {
        format!("^{}(.*)$", regex_escape(&self.prefix))
    }

    pub fn directive(&self) -> Directive {
        Directive::simple("rewrite", [self.pattern().as_str(), "/$1", "break"])
    }
}

fn regex_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(
            c,
            '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '^' | '$' | '{' | '}' | '\\'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Renders a [`RouteTable`] into a [`ConfigArtifact`].
#[derive(Debug, Clone)]
pub struct Renderer {
    keepalive: u32,
}

impl Default for Renderer {
    fn default() -> Self {
        Self { keepalive: 16 }
    }
}

impl Renderer {
    pub fn new(keepalive: u32) -> Self {
        Self { keepalive }
    }

    pub fn render(&self, table: &RouteTable) -> Result<ConfigArtifact, RenderError> {
        let mut upstream_names = HashSet::new();
        let mut location_paths = HashSet::new();

        let mut upstreams = vec![connection_upgrade_map()];
        let mut locations = Vec::new();

        for record in table.routes() {
            let name = record.upstream_name();
            if !upstream_names.insert(name.clone()) {
                return Err(RenderError::DuplicateUpstream(name));
            }
            if !location_paths.insert(record.path_prefix.clone()) {
                return Err(RenderError::DuplicateLocation(record.path_prefix.clone()));
            }

            upstreams.push(self.upstream(record));
            locations.push(location(record));
            if let Some(redirect) = bare_prefix_redirect(record) {
                locations.push(redirect);
            }
        }

        Ok(ConfigArtifact::new(
            serialize(&upstreams),
            serialize(&locations),
        ))
    }

    fn upstream(&self, record: &ContainerRecord) -> Directive {
        let mut body = vec![Directive::simple("server", [record.backend_addr()])];
        if self.keepalive > 0 {
            body.push(Directive::simple(
                "keepalive",
                [self.keepalive.to_string()],
            ));
        }
        Directive::block("upstream", [record.upstream_name()], body)
    }
}

/// `Connection: upgrade` only when the client asked for it, so idle
/// upstream connections can still be kept alive.
fn connection_upgrade_map() -> Directive {
    Directive::block(
        "map",
        ["$http_upgrade", CONNECTION_VAR],
        vec![
            Directive::simple("default", ["upgrade"]),
            Directive::simple("\"\"", [""]),
        ],
    )
}

fn location(record: &ContainerRecord) -> Directive {
    let mut body = Vec::new();

    if let Some(host) = &record.host {
        let guard = format!("{})", host);
        body.push(Directive::block(
            "if",
            ["($host", "!=", guard.as_str()],
            vec![Directive::simple("return", ["404"])],
        ));
    }
    if record.path_prefix != "/" {
        body.push(PrefixRewrite::new(record.path_prefix.as_str()).directive());
    }

    body.extend([
        Directive::simple(
            "proxy_pass",
            [format!("http://{}", record.upstream_name())],
        ),
        Directive::simple("proxy_http_version", ["1.1"]),
        Directive::simple("proxy_set_header", ["Upgrade", "$http_upgrade"]),
        Directive::simple("proxy_set_header", ["Connection", CONNECTION_VAR]),
        Directive::simple("proxy_set_header", ["Host", "$host"]),
        Directive::simple("proxy_set_header", ["X-Real-IP", "$remote_addr"]),
        Directive::simple(
            "proxy_set_header",
            ["X-Forwarded-For", "$proxy_add_x_forwarded_for"],
        ),
        Directive::simple("proxy_set_header", ["X-Forwarded-Proto", "$scheme"]),
        Directive::simple("proxy_connect_timeout", [PROXY_TIMEOUT]),
        Directive::simple("proxy_send_timeout", [PROXY_TIMEOUT]),
        Directive::simple("proxy_read_timeout", [PROXY_TIMEOUT]),
    ]);

    Directive::block("location", [record.path_prefix.as_str()], body)
}

/// `/p` without the trailing slash would otherwise fall through to `/`.
fn bare_prefix_redirect(record: &ContainerRecord) -> Option<Directive> {
    let bare = record.path_prefix.trim_end_matches('/');
    if bare.is_empty() {
        return None;
    }
    Some(Directive::block(
        "location",
        ["=", bare],
        vec![Directive::simple(
            "return",
            ["301".to_string(), format!("{}$is_args$args", record.path_prefix)],
        )],
    ))
}
