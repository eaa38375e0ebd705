use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

pub mod bitmap;
pub mod cidr;

/// Returns `network address + offset` if it still falls inside `net`.
pub fn nth_address(net: &Ipv4Net, offset: u32) -> Option<Ipv4Addr> {
    if u64::from(offset) >= address_count(net) {
        return None;
    }

    Some(Ipv4Addr::from(u32::from(net.network()) + offset))
}

/// Inverse of [`nth_address`].
pub fn offset_of(net: &Ipv4Net, address: &Ipv4Addr) -> Option<u32> {
    if !net.contains(address) {
        return None;
    }

    Some(u32::from(*address) - u32::from(net.network()))
}

pub fn address_count(net: &Ipv4Net) -> u64 {
    1u64 << (32 - net.prefix_len())
}

/// Every MAC the control plane hands out is a pure function of the address
/// it belongs to, so a restarted process computes the same value again.
pub fn mac_from_ipv4(address: &Ipv4Addr) -> String {
    let [a, b, c, d] = address.octets();

    format!("0a:58:{a:02x}:{b:02x}:{c:02x}:{d:02x}")
}

pub fn is_valid_mac(mac: &str) -> bool {
    let groups = mac.split(':').collect::<Vec<_>>();

    groups.len() == 6
        && groups
            .iter()
            .all(|group| group.len() == 2 && u8::from_str_radix(group, 16).is_ok())
}

pub fn nets_overlap(first: &Ipv4Net, second: &Ipv4Net) -> bool {
    first.contains(&second.network()) || second.contains(&first.network())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use ipnet::Ipv4Net;

    use super::{is_valid_mac, mac_from_ipv4, nets_overlap, nth_address, offset_of};

    #[test]
    fn nth_address_stays_inside_the_subnet() {
        let net: Ipv4Net = "10.0.1.0/24".parse().unwrap();

        assert_eq!(nth_address(&net, 0), Some(Ipv4Addr::new(10, 0, 1, 0)));
        assert_eq!(nth_address(&net, 2), Some(Ipv4Addr::new(10, 0, 1, 2)));
        assert_eq!(nth_address(&net, 255), Some(Ipv4Addr::new(10, 0, 1, 255)));
        assert_eq!(nth_address(&net, 256), None);
        assert_eq!(offset_of(&net, &Ipv4Addr::new(10, 0, 1, 77)), Some(77));
        assert_eq!(offset_of(&net, &Ipv4Addr::new(10, 0, 2, 1)), None);
    }

    #[test]
    fn mac_is_derived_from_the_address() {
        let mac = mac_from_ipv4(&Ipv4Addr::new(10, 244, 0, 2));

        assert_eq!(mac, "0a:58:0a:f4:00:02");
        assert!(is_valid_mac(&mac));
        assert!(!is_valid_mac("0a:58:0a:f4:00"));
        assert!(!is_valid_mac("0a:58:0a:f4:00:zz"));
    }

    #[test]
    fn overlap_is_symmetric() {
        let wide: Ipv4Net = "10.0.0.0/16".parse().unwrap();
        let narrow: Ipv4Net = "10.0.4.0/24".parse().unwrap();
        let other: Ipv4Net = "10.1.0.0/16".parse().unwrap();

        assert!(nets_overlap(&wide, &narrow));
        assert!(nets_overlap(&narrow, &wide));
        assert!(!nets_overlap(&wide, &other));
    }
}
