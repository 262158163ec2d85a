//! Recording [`SystemConfigurator`] for control API tests.

use std::sync::Mutex;

use coresentry_core::BoxFuture;
use coresentry_core::sys::{DeviceScope, ProxyStatus, SysError, SystemConfigurator};

/// Records every call as a short string and answers from canned values.
#[derive(Default)]
pub struct FakeSystem {
    calls: Mutex<Vec<String>>,
    status: Mutex<ProxyStatus>,
    reject: Mutex<Option<String>>,
}

impl FakeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, status: ProxyStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Fail every mutating call with `SysError::InvalidRequest(reason)`.
    pub fn reject_with(&self, reason: &str) {
        *self.reject.lock().unwrap() = Some(reason.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<(), SysError> {
        self.calls.lock().unwrap().push(call);
        match self.reject.lock().unwrap().clone() {
            Some(reason) => Err(SysError::InvalidRequest(reason)),
            None => Ok(()),
        }
    }
}

fn scope_label(scope: &DeviceScope) -> String {
    match (&scope.device, scope.only_active) {
        (Some(device), _) => device.clone(),
        (None, true) => "<active>".to_string(),
        (None, false) => "<all>".to_string(),
    }
}

impl SystemConfigurator for FakeSystem {
    fn proxy_status(&self) -> BoxFuture<'_, Result<ProxyStatus, SysError>> {
        Box::pin(async move { Ok(self.status.lock().unwrap().clone()) })
    }

    fn set_pac<'a>(&'a self, url: &'a str, scope: &'a DeviceScope) -> BoxFuture<'a, Result<(), SysError>> {
        Box::pin(async move { self.record(format!("pac {url} {}", scope_label(scope))) })
    }

    fn set_proxy<'a>(
        &'a self,
        server: &'a str,
        bypass: &'a str,
        scope: &'a DeviceScope,
    ) -> BoxFuture<'a, Result<(), SysError>> {
        Box::pin(async move {
            self.record(format!("proxy {server} [{bypass}] {}", scope_label(scope)))
        })
    }

    fn disable_proxy<'a>(&'a self, scope: &'a DeviceScope) -> BoxFuture<'a, Result<(), SysError>> {
        Box::pin(async move { self.record(format!("disable {}", scope_label(scope))) })
    }

    fn set_dns<'a>(&'a self, device: &'a str, servers: &'a [String]) -> BoxFuture<'a, Result<(), SysError>> {
        Box::pin(async move { self.record(format!("dns {device} {}", servers.join(","))) })
    }
}
