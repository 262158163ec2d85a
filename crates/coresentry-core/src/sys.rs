//! System proxy and DNS configuration.
//!
//! The control API delegates these operations to a [`SystemConfigurator`].
//! On macOS [`NetworkSetup`] drives the `networksetup` tool; every other
//! platform gets [`Unsupported`], which rejects each call.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::BoxFuture;

/// Errors from system configuration calls.
#[derive(Debug, thiserror::Error)]
pub enum SysError {
    #[error("unsupported operating system: {0}")]
    Unsupported(&'static str),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no matching network service")]
    NoNetworkService,

    #[error("{program} {args} failed ({status}): {stderr}")]
    Command {
        program: &'static str,
        args: String,
        status: String,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which network services an operation applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceScope {
    /// A single named service. Empty means all services.
    pub device: Option<String>,
    /// Restrict "all services" to those with an assigned address.
    pub only_active: bool,
}

/// Current system proxy settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub device: String,
    pub proxy_enabled: bool,
    pub server: String,
    pub bypass: String,
    pub pac_enabled: bool,
    pub pac_url: String,
}

/// OS collaborator for proxy and DNS changes.
pub trait SystemConfigurator: Send + Sync {
    fn proxy_status(&self) -> BoxFuture<'_, Result<ProxyStatus, SysError>>;

    fn set_pac<'a>(&'a self, url: &'a str, scope: &'a DeviceScope) -> BoxFuture<'a, Result<(), SysError>>;

    /// `server` is `host:port`; `bypass` is a comma or semicolon separated
    /// domain list.
    fn set_proxy<'a>(
        &'a self,
        server: &'a str,
        bypass: &'a str,
        scope: &'a DeviceScope,
    ) -> BoxFuture<'a, Result<(), SysError>>;

    fn disable_proxy<'a>(&'a self, scope: &'a DeviceScope) -> BoxFuture<'a, Result<(), SysError>>;

    /// An empty server list resets the service to DHCP-provided DNS.
    fn set_dns<'a>(&'a self, device: &'a str, servers: &'a [String]) -> BoxFuture<'a, Result<(), SysError>>;
}

/// The configurator for the running platform.
pub fn platform() -> Arc<dyn SystemConfigurator> {
    if cfg!(target_os = "macos") {
        Arc::new(NetworkSetup::default())
    } else {
        Arc::new(Unsupported)
    }
}

/// Rejects every operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsupported;

impl Unsupported {
    fn err<T: Send + 'static>(&self) -> BoxFuture<'static, Result<T, SysError>> {
        Box::pin(async { Err(SysError::Unsupported(std::env::consts::OS)) })
    }
}

impl SystemConfigurator for Unsupported {
    fn proxy_status(&self) -> BoxFuture<'_, Result<ProxyStatus, SysError>> {
        self.err()
    }

    fn set_pac<'a>(&'a self, _url: &'a str, _scope: &'a DeviceScope) -> BoxFuture<'a, Result<(), SysError>> {
        self.err()
    }

    fn set_proxy<'a>(
        &'a self,
        _server: &'a str,
        _bypass: &'a str,
        _scope: &'a DeviceScope,
    ) -> BoxFuture<'a, Result<(), SysError>> {
        self.err()
    }

    fn disable_proxy<'a>(&'a self, _scope: &'a DeviceScope) -> BoxFuture<'a, Result<(), SysError>> {
        self.err()
    }

    fn set_dns<'a>(&'a self, _device: &'a str, _servers: &'a [String]) -> BoxFuture<'a, Result<(), SysError>> {
        self.err()
    }
}

/// macOS `networksetup` driver.
#[derive(Debug, Clone)]
pub struct NetworkSetup {
    program: &'static str,
}

impl Default for NetworkSetup {
    fn default() -> Self {
        Self {
            program: "networksetup",
        }
    }
}

impl NetworkSetup {
    async fn run(&self, args: &[&str]) -> Result<String, SysError> {
        run_tool(self.program, args).await
    }

    /// Resolve the services a scope applies to.
    async fn services(&self, scope: &DeviceScope) -> Result<Vec<String>, SysError> {
        if let Some(device) = scope.device.as_deref().filter(|d| !d.is_empty()) {
            return Ok(vec![device.to_string()]);
        }

        let listing = self.run(&["-listallnetworkservices"]).await?;
        let mut services = parse_service_list(&listing);
        if scope.only_active {
            let mut active = Vec::with_capacity(services.len());
            for service in services {
                let info = self.run(&["-getinfo", &service]).await?;
                if has_ip_address(&info) {
                    active.push(service);
                }
            }
            services = active;
        }

        if services.is_empty() {
            return Err(SysError::NoNetworkService);
        }
        Ok(services)
    }
}

impl SystemConfigurator for NetworkSetup {
    fn proxy_status(&self) -> BoxFuture<'_, Result<ProxyStatus, SysError>> {
        Box::pin(async move {
            let scope = DeviceScope {
                device: None,
                only_active: true,
            };
            let services = self.services(&scope).await?;
            let device = services[0].clone();

            let web = parse_key_values(&self.run(&["-getwebproxy", &device]).await?);
            let auto = parse_key_values(&self.run(&["-getautoproxyurl", &device]).await?);
            let bypass = self.run(&["-getproxybypassdomains", &device]).await?;

            let server = match (web.get("Server"), web.get("Port")) {
                (Some(host), Some(port)) if !host.is_empty() => format!("{host}:{port}"),
                _ => String::new(),
            };
            Ok(ProxyStatus {
                proxy_enabled: web.get("Enabled").is_some_and(|v| v == "Yes"),
                server,
                bypass: parse_bypass_listing(&bypass).join(","),
                pac_enabled: auto.get("Enabled").is_some_and(|v| v == "Yes"),
                pac_url: auto
                    .get("URL")
                    .filter(|u| u.as_str() != "(null)")
                    .cloned()
                    .unwrap_or_default(),
                device,
            })
        })
    }

    fn set_pac<'a>(&'a self, url: &'a str, scope: &'a DeviceScope) -> BoxFuture<'a, Result<(), SysError>> {
        Box::pin(async move {
            if url.is_empty() {
                return Err(SysError::InvalidRequest("url must not be empty".to_string()));
            }
            for service in self.services(scope).await? {
                self.run(&["-setwebproxystate", &service, "off"]).await?;
                self.run(&["-setsecurewebproxystate", &service, "off"]).await?;
                self.run(&["-setautoproxyurl", &service, url]).await?;
                self.run(&["-setautoproxystate", &service, "on"]).await?;
            }
            Ok(())
        })
    }

    fn set_proxy<'a>(
        &'a self,
        server: &'a str,
        bypass: &'a str,
        scope: &'a DeviceScope,
    ) -> BoxFuture<'a, Result<(), SysError>> {
        Box::pin(async move {
            let (host, port) = split_server(server)?;
            let domains = split_bypass(bypass);
            for service in self.services(scope).await? {
                self.run(&["-setautoproxystate", &service, "off"]).await?;
                self.run(&["-setwebproxy", &service, host, port]).await?;
                self.run(&["-setsecurewebproxy", &service, host, port]).await?;

                let mut args = vec!["-setproxybypassdomains", service.as_str()];
                if domains.is_empty() {
                    args.push("Empty");
                } else {
                    args.extend(domains.iter().map(String::as_str));
                }
                self.run(&args).await?;
            }
            Ok(())
        })
    }

    fn disable_proxy<'a>(&'a self, scope: &'a DeviceScope) -> BoxFuture<'a, Result<(), SysError>> {
        Box::pin(async move {
            for service in self.services(scope).await? {
                self.run(&["-setwebproxystate", &service, "off"]).await?;
                self.run(&["-setsecurewebproxystate", &service, "off"]).await?;
                self.run(&["-setautoproxystate", &service, "off"]).await?;
            }
            Ok(())
        })
    }

    fn set_dns<'a>(&'a self, device: &'a str, servers: &'a [String]) -> BoxFuture<'a, Result<(), SysError>> {
        Box::pin(async move {
            if device.is_empty() {
                return Err(SysError::InvalidRequest("device must not be empty".to_string()));
            }
            let mut args = vec!["-setdnsservers", device];
            if servers.is_empty() {
                args.push("Empty");
            } else {
                args.extend(servers.iter().map(String::as_str));
            }
            self.run(&args).await?;
            run_tool("dscacheutil", &["-flushcache"]).await?;
            Ok(())
        })
    }
}

async fn run_tool(program: &'static str, args: &[&str]) -> Result<String, SysError> {
    debug!(program, ?args, "Running system tool");
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await?;
    if !output.status.success() {
        return Err(SysError::Command {
            program,
            args: args.join(" "),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `-listallnetworkservices` output: a header line, then one service per
/// line; disabled services are prefixed with `*`.
fn parse_service_list(listing: &str) -> Vec<String> {
    listing
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('*'))
        .map(str::to_string)
        .collect()
}

fn has_ip_address(info: &str) -> bool {
    info.lines().any(|line| {
        line.strip_prefix("IP address:")
            .map(str::trim)
            .is_some_and(|ip| !ip.is_empty() && ip != "none")
    })
}

/// `Key: value` lines into a map.
fn parse_key_values(text: &str) -> std::collections::HashMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn parse_bypass_listing(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("There aren't any"))
        .map(str::to_string)
        .collect()
}

fn split_server(server: &str) -> Result<(&str, &str), SysError> {
    let (host, port) = server
        .rsplit_once(':')
        .ok_or_else(|| SysError::InvalidRequest(format!("server must be host:port, got {server:?}")))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(SysError::InvalidRequest(format!(
            "server must be host:port, got {server:?}"
        )));
    }
    Ok((host, port))
}

fn split_bypass(bypass: &str) -> Vec<String> {
    bypass
        .split([',', ';'])
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
        .collect()
}
