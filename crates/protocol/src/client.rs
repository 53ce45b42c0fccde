use reqwest::{Client, Proxy};
use std::time::Duration;
use tracing::{info, warn};

/// Proxy resolution outcome for the agent HTTP client.
#[derive(Debug, PartialEq)]
enum ProxyResolution {
    UseProxy(String),
    /// `proxy = ""` disables every proxy, including the environment ones.
    ForceDirectConnect,
    /// Not configured; reqwest reads HTTPS_PROXY / HTTP_PROXY itself.
    None,
}

fn resolve_proxy(proxy: Option<&str>) -> ProxyResolution {
    match proxy {
        Some("") => ProxyResolution::ForceDirectConnect,
        Some(p) => ProxyResolution::UseProxy(p.trim().to_string()),
        None => ProxyResolution::None,
    }
}

/// Build the shared `reqwest::Client` used for every agent call.
pub fn build_http_client(proxy: Option<&str>, timeout: Duration) -> Client {
    let mut builder = Client::builder().timeout(timeout);

    match resolve_proxy(proxy) {
        ProxyResolution::UseProxy(proxy_url) => match Proxy::all(&proxy_url) {
            Ok(p) => {
                info!(proxy = %proxy_url, "Agent client using proxy");
                builder = builder.proxy(p);
            }
            Err(e) => {
                warn!(error = %e, proxy = %proxy_url, "Invalid proxy URL, falling back to direct connect");
            }
        },
        ProxyResolution::ForceDirectConnect => {
            info!("Agent client forced to direct connect (proxy disabled)");
            builder = builder.no_proxy();
        }
        ProxyResolution::None => {}
    }

    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client with proxy, using default");
        Client::new()
    })
}
