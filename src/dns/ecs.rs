//! EDNS Client Subnet ([RFC-7871]) annotation.
//!
//! [RFC-7871]: https://www.rfc-editor.org/rfc/rfc7871

use crate::error::Error;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use trust_dns_proto::op::{Edns, Message};
use trust_dns_proto::rr::rdata::opt::{EdnsCode, EdnsOption};

const ECS_OPTION_CODE: u16 = 8;
const FAMILY_IPV4: u16 = 1;
const FAMILY_IPV6: u16 = 2;

/// Source prefix length used for IPv4 clients.
pub const IPV4_SOURCE_PREFIX: u8 = 24;
/// Source prefix length used for IPv6 clients.
pub const IPV6_SOURCE_PREFIX: u8 = 48;

/// Attach a client subnet derived from `client` to `query`, unless the query already carries a
/// non-empty one.
///
/// The new option goes into a fresh EDNS record that replaces whatever EDNS options the client
/// sent. Only the advertised payload size is carried over.
///
/// # Errors
///
/// Returns [`Error::InvalidClientAddr`] if `client` can't be masked to the subnet prefix.
pub fn annotate(mut query: Message, client: IpAddr) -> Result<Message, Error> {
    if has_client_subnet(&query) {
        return Ok(query);
    }

    let (family, prefix) = match client {
        IpAddr::V4(_) => (FAMILY_IPV4, IPV4_SOURCE_PREFIX),
        IpAddr::V6(_) => (FAMILY_IPV6, IPV6_SOURCE_PREFIX),
    };
    let network = IpNetwork::new(client, prefix)
        .map_err(|_| Error::InvalidClientAddr(client.to_string()))?
        .network();

    let mut edns = Edns::new();
    if let Some(existing) = query.extensions() {
        edns.set_max_payload(existing.max_payload());
    }
    edns.options_mut().insert(EdnsOption::Unknown(
        ECS_OPTION_CODE,
        subnet_option_data(family, prefix, network),
    ));
    query.set_edns(edns);
    Ok(query)
}

/// True if the query has a client subnet option whose address isn't the empty subnet.
///
/// An address whose first two octets are both zero (e.g. `0.0.0.0/0`) counts as empty.
pub fn has_client_subnet(query: &Message) -> bool {
    let Some(edns) = query.extensions() else {
        return false;
    };
    match edns.option(EdnsCode::Subnet) {
        Some(EdnsOption::Unknown(_, data)) => match subnet_address(data) {
            Some(address) => {
                let first = address.first().copied().unwrap_or(0);
                let second = address.get(1).copied().unwrap_or(0);
                first != 0 || second != 0
            }
            None => false,
        },
        _ => false,
    }
}

// Wire layout: FAMILY (u16) | SOURCE PREFIX (u8) | SCOPE PREFIX (u8) | ADDRESS (truncated).
fn subnet_address(data: &[u8]) -> Option<&[u8]> {
    data.get(4..)
}

fn subnet_option_data(family: u16, prefix: u8, network: IpAddr) -> Vec<u8> {
    let octets = match network {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    let address_len = usize::from(prefix).div_ceil(8);

    let mut data = Vec::with_capacity(4 + address_len);
    data.extend_from_slice(&family.to_be_bytes());
    data.push(prefix);
    data.push(0);
    data.extend_from_slice(&octets[..address_len]);
    data
}
