//! Caddy site file generation.
//!
//! The whole file is rebuilt from the service registry on every mutation and
//! swapped in with a single rename; it is never patched in place.

use serde::Serialize;
use std::path::PathBuf;
use tera::Context;

use crate::config::ProxyConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::services::templates;
use crate::store;
use crate::types::ServiceRecord;

#[derive(Serialize)]
struct SiteRoute<'a> {
    name: &'a str,
    ip: &'a str,
    port: u16,
    domain: &'a str,
    created_at: &'a str,
}

#[derive(Debug, Clone)]
pub struct ProxyRenderer {
    site_file: PathBuf,
    log_dir: String,
    tls_email: String,
}

impl ProxyRenderer {
    pub fn new(cfg: &ProxyConfig) -> Self {
        Self {
            site_file: cfg.site_file.clone(),
            log_dir: cfg.log_dir.clone(),
            tls_email: cfg.tls_email.clone(),
        }
    }

    /// Render one site block per service, in registry order.
    pub fn render(&self, services: &[ServiceRecord]) -> GatewayResult<String> {
        let log_dir = token("log dir", self.log_dir.trim_end_matches('/'))?;
        let email = token("tls email", &self.tls_email)?;

        let routes = services
            .iter()
            .map(|svc| {
                Ok(SiteRoute {
                    name: token("name", &svc.name)?,
                    ip: token("ip address", backend_ip(svc))?,
                    port: svc.port,
                    domain: token("domain", &svc.domain)?,
                    created_at: token("created at", &svc.created_at)?,
                })
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        let mut context = Context::new();
        context.insert("routes", &routes);
        context.insert("log_dir", log_dir);
        context.insert("tls_email", email);
        templates::render(templates::CADDY_SITE, &context)
    }

    /// Render `services` and replace the site file with the result. A render
    /// failure leaves the previous file untouched.
    pub fn apply(&self, services: &[ServiceRecord]) -> GatewayResult<()> {
        let text = self.render(services)?;
        store::write_atomic(&self.site_file, text.as_bytes())
            .map_err(|e| GatewayError::Render(format!("{:#}", e)))
    }
}

fn backend_ip(svc: &ServiceRecord) -> &str {
    if svc.ip_address.is_empty() {
        "127.0.0.1"
    } else {
        &svc.ip_address
    }
}

// Values are spliced into Caddyfile syntax; anything that could open or close a
// block or start a new directive is refused.
fn token<'a>(field: &str, value: &'a str) -> GatewayResult<&'a str> {
    if value.is_empty() {
        return Err(GatewayError::Render(format!("{} is empty", field)));
    }
    if value
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '{' || c == '}')
    {
        return Err(GatewayError::Render(format!(
            "{} {:?} contains characters not allowed in a site block",
            field, value
        )));
    }
    Ok(value)
}
