//! Templates for every generated config file, registered once per process.

use once_cell::sync::Lazy;
use std::error::Error as _;
use tera::{Context, Tera};

use crate::error::{GatewayError, GatewayResult};

pub const CADDY_SITE: &str = "erebrus.caddy";
pub const WG_SERVER: &str = "wg-server.conf";
pub const WG_CLIENT: &str = "wg-client.conf";

static TEMPLATES: Lazy<Result<Tera, String>> = Lazy::new(|| {
    let mut tera = Tera::default();
    tera.add_raw_templates(vec![
        (CADDY_SITE, include_str!("../../templates/erebrus.caddy.tera")),
        (WG_SERVER, include_str!("../../templates/wg-server.conf.tera")),
        (WG_CLIENT, include_str!("../../templates/wg-client.conf.tera")),
    ])
    .map_err(|e| describe(&e))?;
    Ok(tera)
});

/// Render a registered template; template and data errors are both `Render`.
pub fn render(name: &str, context: &Context) -> GatewayResult<String> {
    let tera = TEMPLATES
        .as_ref()
        .map_err(|e| GatewayError::Render(format!("templates failed to load: {}", e)))?;
    tera.render(name, context)
        .map_err(|e| GatewayError::Render(describe(&e)))
}

// tera keeps the useful part of the message in the source chain.
fn describe(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
