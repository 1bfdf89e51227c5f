//! Binding table generator.
//!
//! Produces a `binding-table { ... }` block in the data syntax: one
//! softwire per (IPv4, PSID) pair, each with its own B4 address counted up
//! from the starting one.

use std::fmt::Write as _;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{ConfigError, Result};


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingTableParams {
    pub ipv4: Ipv4Addr,
    pub num_ipv4s: u32,
    pub br_address: Ipv6Addr,
    pub b4: Ipv6Addr,
    pub psid_len: u8,
    /// Defaults to `16 - psid_len`; anything smaller reserves the low
    /// `16 - psid_len - shift` port bits.
    pub shift: Option<u8>,
}


impl BindingTableParams {
    fn reserved_bits(&self) -> Result<u8> {
        if self.psid_len > 16 {
            return Err(self.invalid(format!("psid length {} exceeds 16", self.psid_len)));
        }
        let max_shift = 16 - self.psid_len;
        let shift = self.shift.unwrap_or(max_shift);
        if shift > max_shift {
            return Err(self.invalid(format!(
                "shift {} leaves no room for a {}-bit psid",
                shift, self.psid_len
            )));
        }
        Ok(max_shift - shift)
    }

    /// PSIDs handed out per IPv4 address. PSID 0 is reserved once the
    /// address is actually shared.
    fn psids(&self) -> std::ops::Range<u32> {
        if self.psid_len == 0 {
            0..1
        } else {
            1..(1u32 << self.psid_len)
        }
    }

    fn invalid(&self, reason: String) -> ConfigError {
        ConfigError::invalid("generate", "binding-table", reason)
    }
}


/// Render the binding table for `params`.
pub fn generate(params: &BindingTableParams) -> Result<String> {
    let reserved = params.reserved_bits()?;
    let first_v4 = u32::from(params.ipv4);
    let first_b4 = u128::from(params.b4);
    let per_ipv4 = params.psids().len() as u128;

    let last_v4 = first_v4.checked_add(params.num_ipv4s.saturating_sub(1));
    let last_b4 = first_b4.checked_add((params.num_ipv4s as u128 * per_ipv4).saturating_sub(1));
    if last_v4.is_none() || last_b4.is_none() {
        return Err(params.invalid("address range overflows".into()));
    }

    let port_set = if reserved > 0 {
        format!(
            "port-set {{ psid-length {}; reserved-ports-bit-count {}; }}",
            params.psid_len, reserved
        )
    } else {
        format!("port-set {{ psid-length {}; }}", params.psid_len)
    };

    let mut out = String::from("binding-table {\n");
    let mut b4 = first_b4;
    for i in 0..params.num_ipv4s {
        let ipv4 = Ipv4Addr::from(first_v4 + i);
        for psid in params.psids() {
            // Writing to a String cannot fail.
            let _ = writeln!(
                out,
                "  softwire {{ ipv4 {}; psid {}; b4-ipv6 {}; br-address {}; {} }}",
                ipv4,
                psid,
                Ipv6Addr::from(b4),
                params.br_address,
                port_set
            );
            b4 += 1;
        }
    }
    out.push_str("}\n");
    Ok(out)
}
