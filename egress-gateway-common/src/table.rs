//! Diagnostic rendering of a node's egress table.
//!
//! An unset egress IP renders as the unspecified address of the row's family
//! (`0.0.0.0` or `::`) and parses back as unset.

use std::borrow::Cow;
use std::net::IpAddr;

use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::{Error, GatewayTarget, PolicyEntry, Result, unspecified_like};

const HEADERS: [&str; 4] = ["Source IP", "Destination CIDR", "Egress IP", "Gateway IP"];

impl Tabled for PolicyEntry {
    const LENGTH: usize = 4;

    fn fields(&self) -> Vec<Cow<'_, str>> {
        let egress = self
            .egress_ip
            .unwrap_or_else(|| unspecified_like(&self.source_ip));
        vec![
            Cow::Owned(self.source_ip.to_string()),
            Cow::Owned(self.destination_cidr.to_string()),
            Cow::Owned(egress.to_string()),
            Cow::Owned(self.gateway_ip.to_string()),
        ]
    }

    fn headers() -> Vec<Cow<'static, str>> {
        HEADERS.iter().map(|h| Cow::Borrowed(*h)).collect()
    }
}

pub fn render(entries: &[PolicyEntry]) -> String {
    Table::new(entries).with(Style::empty()).to_string()
}

pub fn parse(rendered: &str) -> Result<Vec<PolicyEntry>> {
    let mut entries = Vec::new();
    for (row, line) in rendered.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(HEADERS[0]) {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [source, destination, egress, gateway] = fields.as_slice() else {
            return Err(Error::MalformedRow {
                row,
                reason: format!("expected {} columns, found {}", HEADERS.len(), fields.len()),
            });
        };
        let egress: IpAddr = egress.parse()?;
        entries.push(PolicyEntry {
            source_ip: source.parse()?,
            destination_cidr: destination.parse()?,
            egress_ip: (!egress.is_unspecified()).then_some(egress),
            gateway_ip: gateway.parse::<GatewayTarget>()?,
        });
    }
    Ok(entries)
}
