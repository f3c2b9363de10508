//! Host routing actions: one /128 route per VM IPv6 address

use regex::Regex;
use std::net::Ipv6Addr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use super::execute;
use crate::control::protocol::Params;
use crate::control::registry::{ActionError, ActionModule, Handler};
use crate::control::validate;
use crate::runner::{CommandRunner, CommandSpec};

/// Linux interface names: at most 15 bytes
static DEV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9_.-]{0,14}$").expect("device regex is valid")
});

const IP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct NetworkModule {
    runner: Arc<dyn CommandRunner>,
}

impl NetworkModule {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl ActionModule for NetworkModule {
    fn name(&self) -> &str {
        "network"
    }

    fn handlers(&self) -> Vec<(&'static str, Handler)> {
        let runner = self.runner.clone();
        let add: Handler = Arc::new(move |p: &Params| route(runner.as_ref(), "add", p));
        let runner = self.runner.clone();
        let del: Handler = Arc::new(move |p: &Params| route(runner.as_ref(), "del", p));
        vec![("ip6-route-add", add), ("ip6-route-del", del)]
    }
}

fn host_address(params: &Params) -> Result<Ipv6Addr, ActionError> {
    let raw = validate::string(params, "address")?;
    let addr: Ipv6Addr = raw
        .parse()
        .map_err(|_| ActionError::Validation("address must be a plain IPv6 address".into()))?;
    if addr.is_unspecified() || addr.is_loopback() || addr.is_multicast() {
        return Err(ActionError::Validation(format!(
            "address {} cannot be routed to a VM",
            addr
        )));
    }
    Ok(addr)
}

fn route(runner: &dyn CommandRunner, verb: &'static str, params: &Params) -> Result<String, ActionError> {
    validate::only_keys(params, &["address", "dev"])?;
    let addr = host_address(params)?;
    let dev = validate::matching(params, "dev", &DEV_RE)?;

    let cmd = CommandSpec::new("ip")
        .args(["-6", "route", verb])
        .arg(format!("{}/128", addr))
        .args(["dev", dev])
        .timeout(IP_TIMEOUT);

    match execute(runner, &cmd) {
        // Adding a route that is already there is success
        Err(ActionError::Execution(msg)) if verb == "add" && msg.contains("File exists") => {
            tracing::debug!(address = %addr, "Route already present");
            Ok(String::new())
        }
        other => other,
    }
}
